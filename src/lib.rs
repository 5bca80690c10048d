/// comfyctl — core library
///
/// Provides the runtime environment record, the engine process supervisor
/// (handle + registry), the async job and log planes, the collaborator
/// modules (installer, model downloader, custom-node manager, GPU probe),
/// and the REST/WebSocket transport layer.
pub mod env;
pub mod device;
pub mod settings;
pub mod kill;
pub mod process;
pub mod registry;
pub mod jobs;
pub mod loghub;
pub mod gpu;
pub mod install;
pub mod models;
pub mod nodes;
pub mod api;
