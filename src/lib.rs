pub mod cache;
pub mod calculation;
pub mod config;
pub mod lock;
pub mod metrics;
pub mod processor;
pub mod store;
pub mod strategy;
pub mod testing;
pub mod weights;

// Re-export the processor entry point
pub use processor::Processor;

// Re-export configuration types
pub use config::{ConfigError, MutableConfig, ProcessorConfig};

// Re-export the store and lock contracts
pub use lock::{DistributedLock, LockError};
pub use store::{
    SamplingStore, ServiceOperationProbabilities, ServiceOperationQPS, StoreError, Throughput,
};

// Re-export strategy response types
pub use strategy::{
    OperationSamplingStrategy, PerOperationSamplingStrategies, ProbabilisticSamplingStrategy,
    SamplingStrategyResponse, SamplingStrategyType,
};
