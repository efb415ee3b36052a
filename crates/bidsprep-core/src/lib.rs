pub mod anat;
pub mod config;
pub mod denoise;
pub mod error;
pub mod fsutil;
pub mod locks;
pub mod masks;
pub mod metadata;
pub mod naming;
pub mod nifti_header;
pub mod pipeline;
pub mod progress;
pub mod quality;
pub mod registration;
pub mod registry;
pub mod staging;
pub mod tools;
pub mod tsnr;

pub use config::{AppConfig, Overwrite};
pub use error::{Error, ToolFailure};
pub use pipeline::{Pipeline, RunReport, Stage, SubjectFailure};
pub use progress::{ProgressReporter, SilentReporter};
pub use registry::Registry;
pub use tools::{Executor, ToolInvoker, ToolOutput, ToolSpec};
