//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `weft_core` linkage.
//! - Keep output deterministic for quick local sanity checks.

fn main() {
    println!("weft_core version={}", weft_core::core_version());
}
