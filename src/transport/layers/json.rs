use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::envelope::Envelope;
use crate::transport::RawPayload;

/// Tower `Service` wrapper that serializes envelopes to JSON.
///
/// The *entire* envelope is serialized, metadata included, so identity,
/// correlation, and delivery fields round-trip exactly across the wire.
/// The inner service receives an envelope whose payload is the serialized
/// bytes but whose metadata fields are still available natively, which
/// lets a sender backend map them onto wire headers as well.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Envelope<M>> for JsonService<T>
where
    M: serde::Serialize + Send + 'static,
    T: Service<Envelope<RawPayload>> + Clone + Send + 'static,
    <T as Service<Envelope<RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<M>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bytes = serde_json::to_vec(&req).map_err(Box::new)?;
            let envelope = req.map_message(|_| RawPayload::from(bytes));

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`JsonService`] to a service stack.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}
