#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use umbra_shadow::{BlockLayout, ShadowConfig, ShadowEngine};

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn engine() -> ShadowEngine {
    init_tracing();
    ShadowEngine::init(ShadowConfig::default()).expect("engine init should succeed")
}

pub fn engine_with(layout: BlockLayout) -> ShadowEngine {
    init_tracing();
    ShadowEngine::init(ShadowConfig::default().with_layout(layout))
        .expect("engine init should succeed")
}

pub const LAYOUTS: [BlockLayout; 2] = [BlockLayout::Bitmap2, BlockLayout::Bytemap4to1];
