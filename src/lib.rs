pub mod channel;
pub mod config;
pub mod csv_source;
pub mod error;
pub mod handle_pool;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod top_k;
pub mod worker;
pub mod worker_pool;

pub use config::PipelineConfig;
pub use error::*;
pub use logging::init_tracing;
pub use pipeline::PriceList;
pub use record::{Field, Record};
pub use top_k::{ShrinkReport, StoreConfig, TopKStore};
