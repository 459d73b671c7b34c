//! File comparison policy.
//!
//! Some build products are rewritten by tooling outside the node that
//! produced them. The policy names those files so a mismatch becomes a
//! warning, or is accepted silently, instead of failing the comparison.

use serde::{Deserialize, Serialize};

/// How a file name is matched against an allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameRule {
    Exact(String),
    Contains(String),
    EndsWith(String),
}

impl NameRule {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameRule::Exact(s) => name == s,
            NameRule::Contains(s) => name.contains(s.as_str()),
            NameRule::EndsWith(s) => name.ends_with(s.as_str()),
        }
    }
}

/// Allow-list membership of a file name.
///
/// A name on the ok-to-differ list may differ in size and timestamp. A name
/// on the silent list may differ in timestamp and its mismatches are only
/// logged as information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leniency {
    pub ok_to_differ: bool,
    pub silent: bool,
}

impl Leniency {
    pub const STRICT: Leniency = Leniency {
        ok_to_differ: false,
        silent: false,
    };

    pub fn timestamp_may_differ(&self) -> bool {
        self.ok_to_differ || self.silent
    }

    pub fn size_may_differ(&self) -> bool {
        self.ok_to_differ
    }
}

/// Tolerance and allow-lists used when comparing two file entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparePolicy {
    /// Maximum timestamp difference, exclusive. FAT file systems store
    /// write times with two second resolution.
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
    #[serde(default = "default_ok_to_differ")]
    pub ok_to_differ: Vec<NameRule>,
    #[serde(default = "default_silent")]
    pub silent: Vec<NameRule>,
}

fn default_tolerance_ms() -> u64 {
    2000
}

fn default_ok_to_differ() -> Vec<NameRule> {
    vec![
        NameRule::Contains("Engine/Binaries/DotNET/".to_string()),
        NameRule::EndsWith("MacOS/libogg.dylib".to_string()),
        NameRule::EndsWith("MacOS/libvorbis.dylib".to_string()),
        NameRule::EndsWith("Contents/MacOS/UE4Editor".to_string()),
        NameRule::Contains("Engine/Binaries/Mac/UE4Editor.app/Contents/MacOS/".to_string()),
    ]
}

fn default_silent() -> Vec<NameRule> {
    let mut rules: Vec<NameRule> = [
        "DotNETUtilities.dll",
        "DotNETUtilities.pdb",
        "RPCUtility.exe",
        "RPCUtility.pdb",
        "AutomationTool.exe",
        "AutomationTool.exe.config",
        "AutomationUtils.Automation.dll",
        "AutomationUtils.Automation.pdb",
        "UnrealBuildTool.exe",
        "UnrealBuildTool.exe.config",
        "EnvVarsToXML.exe",
        "EnvVarsToXML.exe.config",
    ]
    .iter()
    .map(|file| NameRule::Exact(format!("Engine/Binaries/DotNET/{}", file)))
    .collect();
    rules.push(NameRule::Contains("Engine/Binaries/Mac".to_string()));
    rules
}

impl Default for ComparePolicy {
    fn default() -> Self {
        Self {
            tolerance_ms: default_tolerance_ms(),
            ok_to_differ: default_ok_to_differ(),
            silent: default_silent(),
        }
    }
}

impl ComparePolicy {
    /// A policy with the default tolerance and no allow-list.
    pub fn strict() -> Self {
        Self {
            tolerance_ms: default_tolerance_ms(),
            ok_to_differ: vec![],
            silent: vec![],
        }
    }

    pub fn leniency(&self, name: &str) -> Leniency {
        Leniency {
            ok_to_differ: self.ok_to_differ.iter().any(|rule| rule.matches(name)),
            silent: self.silent.iter().any(|rule| rule.matches(name)),
        }
    }

    /// Whether two timestamps, in milliseconds apart, are close enough.
    pub fn within_tolerance(&self, delta_ms: i64) -> bool {
        delta_ms.unsigned_abs() < self.tolerance_ms
    }
}
