pub mod adapters;
pub mod client;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod lang;
pub mod models;
pub mod modes;
pub mod processor;
pub mod registry;
pub mod server;
pub mod simulator;
pub mod stream;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::client::{ExecutionClient, LocalClient, RemoteClient};
    pub use crate::config::{RemoteConfig, RemoteConfigSource, StaticRemoteConfig};
    pub use crate::db::{self, SqliteStore};
    pub use crate::dispatcher::{Dispatcher, ExecutionRequest};
    pub use crate::error::AiError;
    pub use crate::lang::{DefaultLang, Lang};
    pub use crate::models::{
        DispatchOutput, ExecutionConfig, ExecutionMode, ExecutionResult, Message, ModelDescriptor,
        ProviderConfig, ProviderType, RaceEntry, RaceStatus,
    };
    pub use crate::modes::Engine;
    pub use crate::registry::{InMemoryRegistry, ProviderRegistry};
    pub use crate::stream::{StreamEvent, StreamSink};
    pub use crate::{server, telemetry};
}
