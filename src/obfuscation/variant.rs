//! Obfuscation variants and the compile configuration each one implies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Optimization level every variant is compiled with.
pub const OPTIMIZATION_LEVEL: &str = "O1";

/// Header include injected by the string obfuscator into every rewritten source.
pub const ADV_MARKER: &str = "#include \"/Lib/Log.h\"";

/// Compiler used for the LLVM pass-based variants.
pub const LLVM_COMPILER: &str = "clang";

/// Compiler used for sources rewritten by the string obfuscator (C++ templates).
pub const ADV_COMPILER: &str = "g++";

/// One named compile configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ObfuscationVariant {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "llvm-obfuscation-fla")]
    LlvmFla,
    #[serde(rename = "llvm-obfuscation-sub")]
    LlvmSub,
    #[serde(rename = "llvm-obfuscation-bcf")]
    LlvmBcf,
    #[serde(rename = "llvm-obfuscation-all")]
    LlvmAll,
    #[serde(rename = "adv-obfuscation")]
    AdvObfuscation,
}

impl ObfuscationVariant {
    /// Every variant, in processing order. The source-rewriting variant edits
    /// the working tree in place and must stay last.
    pub const ALL: [ObfuscationVariant; 6] = [
        Self::None,
        Self::LlvmFla,
        Self::LlvmSub,
        Self::LlvmBcf,
        Self::LlvmAll,
        Self::AdvObfuscation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::LlvmFla => "llvm-obfuscation-fla",
            Self::LlvmSub => "llvm-obfuscation-sub",
            Self::LlvmBcf => "llvm-obfuscation-bcf",
            Self::LlvmAll => "llvm-obfuscation-all",
            Self::AdvObfuscation => "adv-obfuscation",
        }
    }

    /// Extra compiler flags enabling the variant's LLVM passes.
    pub fn llvm_flags(&self) -> &'static [&'static str] {
        match self {
            Self::LlvmFla => &["-mllvm", "-fla"],
            Self::LlvmSub => &["-mllvm", "-sub"],
            Self::LlvmBcf => &["-mllvm", "-bcf"],
            Self::LlvmAll => &["-mllvm", "-fla", "-mllvm", "-sub", "-mllvm", "-bcf"],
            Self::None | Self::AdvObfuscation => &[],
        }
    }

    pub fn is_llvm(&self) -> bool {
        !self.llvm_flags().is_empty()
    }

    /// Whether the variant rewrites sources before compilation.
    pub fn rewrites_sources(&self) -> bool {
        matches!(self, Self::AdvObfuscation)
    }
}

impl fmt::Display for ObfuscationVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObfuscationVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown obfuscation variant '{s}'"))
    }
}

/// Immutable compile configuration for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantConfig {
    pub variant: ObfuscationVariant,
    /// Compiler binary handed to `make` as `CC`.
    pub compiler: String,
    /// Complete flag string: baseline, optimization level, variant extras.
    pub flags: String,
    /// Marker that must appear in compiled sources, for rewriting variants.
    pub marker: Option<&'static str>,
}

impl VariantConfig {
    /// Derive the configuration of `variant` from the baseline compiler and flags.
    pub fn new(variant: ObfuscationVariant, base_compiler: &str, base_flags: &str) -> Self {
        let compiler = if variant.is_llvm() {
            LLVM_COMPILER
        } else if variant.rewrites_sources() {
            ADV_COMPILER
        } else {
            base_compiler
        };

        let optimization = format!("-{OPTIMIZATION_LEVEL}");
        let flags = base_flags
            .split_whitespace()
            .chain(std::iter::once(optimization.as_str()))
            .chain(variant.llvm_flags().iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            variant,
            compiler: compiler.to_string(),
            flags,
            marker: variant.rewrites_sources().then_some(ADV_MARKER),
        }
    }

    pub fn requires_verification(&self) -> bool {
        self.marker.is_some()
    }
}

/// Configurations for every variant, in processing order.
pub fn variant_plan(base_compiler: &str, base_flags: &str) -> Vec<VariantConfig> {
    ObfuscationVariant::ALL
        .into_iter()
        .map(|variant| VariantConfig::new(variant, base_compiler, base_flags))
        .collect()
}
