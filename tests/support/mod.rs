#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edit_guard_core::execution::{ToolOutput, ToolRegistry, ToolRegistryError};
use edit_guard_core::learning::{InMemoryLearningStore, SharedLearningStore};
use edit_guard_core::settings::{GuardSettings, SimilarityWeights};
use edit_guard_core::tools::ToolCall;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

pub const WIDTH: u32 = 200;
pub const HEIGHT: u32 = 200;
pub const RED_END: u32 = 80;
pub const BLUE_END: u32 = 140;

/// Vertical bands: 40% red, 30% blue, 30% white.
pub fn bands() -> RgbaImage {
    RgbaImage::from_fn(WIDTH, HEIGHT, |x, _| match x {
        x if x < RED_END => Rgba([255, 0, 0, 255]),
        x if x < BLUE_END => Rgba([0, 0, 255, 255]),
        _ => Rgba([255, 255, 255, 255]),
    })
}

pub fn png(image: &RgbaImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut out, ImageFormat::Png)
        .expect("png encodes");
    out.into_inner()
}

pub fn bands_png() -> Arc<[u8]> {
    Arc::from(png(&bands()))
}

/// Defaults with retry delays shrunk so tests stay fast.
pub fn fast_settings() -> GuardSettings {
    let mut settings = GuardSettings::default();
    settings.retry.backoff_base_ms = 1;
    settings.retry.backoff_max_ms = 5;
    settings.retry.rate_limit_delay_ms = 5;
    settings.retry.execution_timeout_ms = 5_000;
    settings
}

pub fn memory_store() -> SharedLearningStore {
    Arc::new(InMemoryLearningStore::new(100, 70, SimilarityWeights::default()))
}

pub fn temp_db_path(label: &str) -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("edit-guard-{label}-{}", uuid::Uuid::new_v4()))
        .join("learning.db")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Knockout removes 96% of the image at tolerance >= 50, else the red band.
    /// Recolor turns the blue band green.
    Pixels,
    Fail(&'static str),
    Sleep(Duration),
    Panic,
}

pub struct ScriptedRegistry {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedRegistry {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ToolRegistry for ScriptedRegistry {
    fn invoke(&self, call: &ToolCall, image: &[u8]) -> Result<ToolOutput, ToolRegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Fail(message) => Err(ToolRegistryError::Failed(message.to_string())),
            Script::Sleep(delay) => {
                std::thread::sleep(delay);
                Ok(ToolOutput {
                    image: image.to_vec(),
                })
            }
            Script::Panic => panic!("registry exploded"),
            Script::Pixels => {
                let mut pixels = image::load_from_memory(image)?.to_rgba8();
                match call {
                    ToolCall::ColorKnockout(params) => {
                        let cutoff = if params.tolerance >= 50 {
                            WIDTH * 96 / 100
                        } else {
                            RED_END
                        };
                        for (x, _, pixel) in pixels.enumerate_pixels_mut() {
                            if x < cutoff {
                                pixel[3] = 0;
                            }
                        }
                    }
                    ToolCall::Recolor(_) => {
                        for (x, _, pixel) in pixels.enumerate_pixels_mut() {
                            if (RED_END..BLUE_END).contains(&x) {
                                *pixel = Rgba([0, 255, 0, 255]);
                            }
                        }
                    }
                    other => return Err(ToolRegistryError::Unsupported(other.tool())),
                }
                Ok(ToolOutput {
                    image: png(&pixels),
                })
            }
        }
    }
}
