//! Event handlers: what the broker does with an event once it is accepted.

mod printer;
mod record;
mod relay;
mod spawn;
mod writer;

pub use printer::EventPrinter;
pub use record::EventRecorder;
pub use relay::EventRelay;
pub use spawn::SpawnCommand;
pub use writer::EventWriter;
