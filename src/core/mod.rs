pub mod dependencies;
pub mod device;
pub mod image;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod runner;
pub mod split;
pub mod transfer;

pub use dependencies::{DependencyService, ToolStatus};
pub use device::DeviceService;
pub use image::ImageService;
pub use models::{ImageInfo, RemovableDrive, WimInfo};
pub use orchestrator::{CreationOptions, Orchestrator};
pub use progress::{CreationProgress, CreationStage, ProgressTracker};
pub use runner::{CommandResult, CommandRunner, CommandSpec};
pub use split::SplitService;
pub use transfer::TransferService;
