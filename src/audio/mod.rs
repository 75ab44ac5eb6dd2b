//! Audio transport, engine, and monitoring

pub mod clock;
pub mod device;
pub mod engine;
pub mod latency;
pub mod ring;
pub mod stats;
pub mod transport;

pub use device::{list_input_devices, list_output_devices, DeviceInfo};
pub use engine::{AudioEngine, EngineError, EngineMonitor, StreamSpec};
pub use latency::{LatencyShared, LatencyTracker};
pub use ring::{RingConsumer, RingCounters, RingProducer, SampleRing, DEFAULT_RING_CAPACITY};
pub use stats::{platform_stats, NullStats, SystemStats};
pub use transport::{SafeModeState, TransportProfile, TransportRouter};
