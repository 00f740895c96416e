//! wasm transport: `gloo-net` fetch with the body read as a `ReadableStream`.

use bevy::prelude::*;
use futures_lite::StreamExt;
use gloo_net::http::{Request, Response};
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::ReadableStreamDefaultReader;
use web_sys::js_sys::{Reflect, Uint8Array};

use super::{
    ByteChunks, ChatReply, ChatRequestBody, ChatTransport, DispatchError, Endpoints, SessionInfo,
};

const CHUNK_QUEUE: usize = 64;

#[derive(Clone)]
pub struct FetchTransport {
    endpoints: Endpoints,
}

impl FetchTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            endpoints: Endpoints::new(base_url),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn post_json(&self, url: &str, text: &str) -> Result<Response, DispatchError> {
        let res = Request::post(url)
            .header("Content-Type", "application/json")
            .json(&ChatRequestBody { message: text })
            .map_err(DispatchError::connection)?
            .send()
            .await
            .map_err(DispatchError::connection)?;
        ensure_success(res).await
    }
}

async fn ensure_success(res: Response) -> Result<Response, DispatchError> {
    if res.ok() {
        return Ok(res);
    }
    let status = res.status();
    let status_text = res.status_text();
    let body = res.binary().await.unwrap_or_default();
    warn!(target: "bevy_rag_chat", "http {} from backend", status);
    Err(DispatchError::http(status, &status_text, &body))
}

async fn read_json<T: serde::de::DeserializeOwned>(res: Response) -> Result<T, DispatchError> {
    res.json::<T>()
        .await
        .map_err(|e| DispatchError::connection(format!("invalid response body: {e}")))
}

fn js_error(value: JsValue) -> DispatchError {
    DispatchError::connection(format!("{value:?}"))
}

/// read `reader` into `tx` until the body ends or the receiver goes away.
/// the reader is cancelled and unlocked either way.
async fn pump_reader(
    reader: ReadableStreamDefaultReader,
    tx: flume::Sender<Result<Vec<u8>, DispatchError>>,
) {
    loop {
        let step = match JsFuture::from(reader.read()).await {
            Ok(step) => step,
            Err(e) => {
                let _ = tx.send_async(Err(js_error(e))).await;
                break;
            }
        };
        let done = Reflect::get(&step, &JsValue::from_str("done"))
            .ok()
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if done {
            break;
        }
        let Ok(value) = Reflect::get(&step, &JsValue::from_str("value")) else {
            break;
        };
        let bytes = Uint8Array::new(&value).to_vec();
        if tx.send_async(Ok(bytes)).await.is_err() {
            debug!(target: "bevy_rag_chat", "stream consumer dropped; cancelling body reader");
            let _ = reader.cancel();
            break;
        }
    }
    let _ = reader.release_lock();
}

#[async_trait::async_trait(?Send)]
impl ChatTransport for FetchTransport {
    async fn send_message(&self, text: &str) -> Result<ChatReply, DispatchError> {
        let url = self.endpoints.message();
        debug!(target: "bevy_rag_chat", "POST {url} (len={})", text.len());
        read_json(self.post_json(&url, text).await?).await
    }

    async fn send_message_stream(&self, text: &str) -> Result<ByteChunks, DispatchError> {
        let url = self.endpoints.message_stream();
        debug!(target: "bevy_rag_chat", "POST {url} (stream, len={})", text.len());
        let res = self.post_json(&url, text).await?;
        let Some(body) = res.body() else {
            return Ok(futures_lite::stream::empty().boxed());
        };
        let reader: ReadableStreamDefaultReader = body.get_reader().unchecked_into();
        let (tx, rx) = flume::bounded(CHUNK_QUEUE);
        wasm_bindgen_futures::spawn_local(pump_reader(reader, tx));
        Ok(rx.into_stream().boxed())
    }

    async fn create_session(&self) -> Result<SessionInfo, DispatchError> {
        let res = Request::post(&self.endpoints.sessions())
            .send()
            .await
            .map_err(DispatchError::connection)?;
        read_json(ensure_success(res).await?).await
    }
}
