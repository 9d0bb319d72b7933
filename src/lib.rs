pub mod panic_handler;
pub mod pdf;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export the pipeline entry points
pub use pdf::{
    AssetChange, CurrentValue, InvalidationBus, PipelineConfig, RenderEvent, RenderFault,
    RenderPipeline, RenderRequest, RenderedImage,
};
