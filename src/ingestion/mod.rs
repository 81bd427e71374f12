//! Flow ingestion: UDP collectors, protocol parsers, backpressure
//! queue, and the batch writer.

pub mod backpressure;
pub mod batch_writer;
pub mod collector;
pub mod parsers;

pub use backpressure::{BackpressureQueue, BackpressureState, QueueStats};
pub use batch_writer::{BatchWriter, BatchWriterConfig};
pub use collector::{is_private_ip, CollectorError, FlowCollector, ProtocolDispatch};
pub use parsers::{FlowParser, ParseError};
