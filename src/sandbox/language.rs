//! Languages for run_code and package managers for install_package

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::SandboxError;

/// A language `run_code` knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Ruby,
    Bash,
    Sh,
    Go,
    Rust,
    C,
}

/// How to turn a source file into a running program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPlan {
    /// Run the interpreter on the source file
    Interpret { program: String, args: Vec<String> },
    /// Compile first, then execute the produced binary
    Compile {
        compiler: String,
        args: Vec<String>,
        binary: String,
    },
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::JavaScript,
        Language::Ruby,
        Language::Bash,
        Language::Sh,
        Language::Go,
        Language::Rust,
        Language::C,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Ruby => "ruby",
            Language::Bash => "bash",
            Language::Sh => "sh",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::C => "c",
        }
    }

    /// File extension of generated source files
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::Ruby => "rb",
            Language::Bash | Language::Sh => "sh",
            Language::Go => "go",
            Language::Rust => "rs",
            Language::C => "c",
        }
    }

    /// Build the command(s) for a source file at `source`.
    ///
    /// `binary` is where compiled languages put their output.
    pub fn plan(&self, source: &str, binary: &str) -> RunPlan {
        let interpret = |program: &str, pre: &[&str]| RunPlan::Interpret {
            program: program.to_string(),
            args: pre
                .iter()
                .map(|s| s.to_string())
                .chain(std::iter::once(source.to_string()))
                .collect(),
        };

        match self {
            Language::Python => interpret("python3", &[]),
            Language::JavaScript => interpret("node", &[]),
            Language::Ruby => interpret("ruby", &[]),
            Language::Bash => interpret("bash", &[]),
            Language::Sh => interpret("sh", &[]),
            Language::Go => interpret("go", &["run"]),
            Language::Rust => RunPlan::Compile {
                compiler: "rustc".to_string(),
                args: vec![
                    "--edition".to_string(),
                    "2021".to_string(),
                    source.to_string(),
                    "-o".to_string(),
                    binary.to_string(),
                ],
                binary: binary.to_string(),
            },
            Language::C => RunPlan::Compile {
                compiler: "cc".to_string(),
                args: vec![source.to_string(), "-o".to_string(), binary.to_string()],
                binary: binary.to_string(),
            },
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "ruby" | "rb" => Ok(Language::Ruby),
            "bash" => Ok(Language::Bash),
            "sh" | "shell" => Ok(Language::Sh),
            "go" | "golang" => Ok(Language::Go),
            "rust" | "rs" => Ok(Language::Rust),
            "c" => Ok(Language::C),
            _ => Err(SandboxError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// A package manager `install_package` can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Pip,
    Npm,
    Gem,
    Go,
    Cargo,
    Apt,
}

impl PackageManager {
    pub const ALL: [PackageManager; 6] = [
        PackageManager::Pip,
        PackageManager::Npm,
        PackageManager::Gem,
        PackageManager::Go,
        PackageManager::Cargo,
        PackageManager::Apt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Pip => "pip",
            PackageManager::Npm => "npm",
            PackageManager::Gem => "gem",
            PackageManager::Go => "go",
            PackageManager::Cargo => "cargo",
            PackageManager::Apt => "apt",
        }
    }

    /// Program and arguments installing `package`
    ///
    /// The name must already have passed [`validate_package_name`].
    pub fn install_command(&self, package: &str) -> (String, Vec<String>) {
        let owned = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        match self {
            PackageManager::Pip => (
                "python3".to_string(),
                owned(&["-m", "pip", "install", "--user", package]),
            ),
            PackageManager::Npm => ("npm".to_string(), owned(&["install", package])),
            PackageManager::Gem => (
                "gem".to_string(),
                owned(&["install", "--user-install", package]),
            ),
            PackageManager::Go => {
                let target = if package.contains('@') {
                    package.to_string()
                } else {
                    format!("{}@latest", package)
                };
                ("go".to_string(), owned(&["install", &target]))
            }
            PackageManager::Cargo => ("cargo".to_string(), owned(&["install", package])),
            PackageManager::Apt => ("apt-get".to_string(), owned(&["install", "-y", package])),
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pip" | "pip3" => Ok(PackageManager::Pip),
            "npm" => Ok(PackageManager::Npm),
            "gem" => Ok(PackageManager::Gem),
            "go" => Ok(PackageManager::Go),
            "cargo" => Ok(PackageManager::Cargo),
            "apt" | "apt-get" => Ok(PackageManager::Apt),
            _ => Err(SandboxError::UnsupportedPackageManager(s.to_string())),
        }
    }
}

/// Reject names that would be read as options or split into several words
pub fn validate_package_name(name: &str) -> Result<(), SandboxError> {
    let bad = name.is_empty()
        || name.starts_with('-')
        || name.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(SandboxError::InvalidPackage(name.to_string()));
    }
    Ok(())
}
