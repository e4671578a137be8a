mod cache;
mod command;
pub mod control;
mod error;
mod events;
pub mod executor;
mod record;
mod request_monitor;
pub mod sequence;
mod services;
mod session;
mod settings;
#[cfg(all(unix, any(test, feature = "test-support")))]
pub mod test_support;
pub mod transport;

pub use cache::CommandCache;
pub use command::{
    Command, CommandHandle, CommandId, CommandOutput, ExecutionContext,
};
pub use error::{RequestError, INTERNAL_ERROR, REQUEST_FAILED};
pub use events::{CommandEvent, CommandInfo, SessionEvent};
pub use executor::{Executor, ScheduledTask, TaskFault};
pub use record::{
    AsyncKind, AsyncRecord, Protocol, Record, ResultClass, ResultRecord, StreamKind, StreamRecord,
    Token,
};
pub use request_monitor::{
    CountingRequestMonitor, DataRequestMonitor, RequestMonitor, RequestResult, RequestStatus,
};
pub use sequence::{step, FnStep, Sequence, SequenceState, Step};
pub use services::{ServiceRegistration, ServicesTracker};
pub use session::{CommandSink, Session, SessionId, SessionState, Subscription};
pub use settings::SessionSettings;
pub use transport::{IoKind, Transport, TransportEvent, TransportIo};

#[cfg(test)]
#[ctor::ctor]
fn init_logger() {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }
}
