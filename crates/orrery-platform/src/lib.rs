// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use winit::dpi::{LogicalSize, PhysicalSize};
use winit::window::{Window, WindowAttributes};

pub fn window_attributes(title: &str, width: u32, height: u32) -> WindowAttributes {
    Window::default_attributes()
        .with_title(title)
        .with_inner_size(LogicalSize::new(width.max(1), height.max(1)))
}

/// A minimized window reports a zero-area framebuffer.
pub fn is_zero_area(size: PhysicalSize<u32>) -> bool {
    size.width == 0 || size.height == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_detection() {
        assert!(is_zero_area(PhysicalSize::new(0, 600)));
        assert!(is_zero_area(PhysicalSize::new(800, 0)));
        assert!(!is_zero_area(PhysicalSize::new(800, 600)));
    }
}
