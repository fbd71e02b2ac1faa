//! Message-queue substrate: envelopes, the outbound/inbound channel pair over
//! JetStream, and the correlation broker that turns them into request/response.

pub mod channel;
pub mod correlation;
pub mod envelope;
pub mod pool;

pub use channel::{ChannelPair, CommandSink, InboundChannel, MqConfig, OutboundChannel, TransportError};
pub use correlation::{CallError, CorrelationBroker};
pub use envelope::{CommandEnvelope, ResultEnvelope, ResultStatus};
pub use pool::NatsPool;
