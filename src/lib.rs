#![doc = include_str!("../README.md")]

pub mod bus;
pub mod dispatch;
pub mod envelope;
pub mod outbox;
pub mod pipeline;
pub mod session;
pub mod transport;

#[doc(inline)]
pub use envelope::{DeliveryOptions, Destination, Envelope, Message, Router};

#[doc(inline)]
pub use pipeline::{
    AfterStage, BeforeStage, Continuation, Handler, HandlerError, HandlerErrorKind,
    HandlerRegistry, InvocationOutcome, Pipeline,
};

#[doc(inline)]
pub use session::{SessionError, UnitOfWork, UnitOfWorkSession};

#[doc(inline)]
pub use bus::{InvokeError, InvokeErrorKind, InvokeReply, MessageBus};

#[doc(inline)]
pub use outbox::{OutboxEntry, OutboxError, OutboxStore};

#[doc(inline)]
pub use dispatch::{
    DefaultDispatchHook, DispatchHook, DispatchRunError, DispatchRunErrorKind, Dispatcher,
};

#[doc(inline)]
pub use transport::{Sender, Transport, TransportError, TransportErrorKind};
