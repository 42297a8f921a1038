// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: device setup, asset loading, pipelines, swapchain and the frame loop.
pub mod assets;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod jobs;
pub mod memory;
pub mod mesh;
pub mod pipeline;
mod renderer;
pub mod swapchain;
pub mod texture;
pub mod upload;

pub use error::{AllocationError, AssetError, FrameError};
pub use frame::{DrawPlan, FrameBackend, FrameLoop, FrameOutcome};
pub use renderer::VkRenderer;
pub use swapchain::SwapchainState;
