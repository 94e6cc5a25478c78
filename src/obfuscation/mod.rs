//! Obfuscation variants, the source obfuscator seam, and post-hoc verification.
//!
//! Each repository is compiled once per [`ObfuscationVariant`]. Pass-based
//! variants only change the compiler and its flags; the string-obfuscation
//! variant rewrites sources first and is then verified by scanning for the
//! injected header.

pub mod applicator;
pub mod variant;
pub mod verify;

pub use applicator::{DockerObfuscator, SourceObfuscator, DEFAULT_OBFUSCATOR_IMAGE};
pub use variant::{
    variant_plan, ObfuscationVariant, VariantConfig, ADV_COMPILER, ADV_MARKER, LLVM_COMPILER,
    OPTIMIZATION_LEVEL,
};
pub use verify::contains_marker;
