//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Configuration for a supported programming language
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageConfig {
    /// Canonical language name (table key in the TOML file)
    pub name: String,
    /// Name of the source file (e.g., "Main.java")
    pub source_file: String,
    /// Compile command (None for scripting-style targets)
    pub compile_command: Option<Vec<String>>,
    /// Run command
    pub run_command: Vec<String>,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Language table keyed by lowercase name and alias
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageConfig>,
}

impl LanguageRegistry {
    /// Load the table compiled into the binary
    pub fn embedded() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    /// Load an operator-supplied table
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut languages = HashMap::new();

        for (name, raw) in raw_configs {
            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run command for {}", name);
            }
            if raw.source_file.contains('/') || raw.source_file.contains("..") {
                anyhow::bail!("Invalid source file name for {}: {}", name, raw.source_file);
            }

            let config = LanguageConfig {
                name: name.to_lowercase(),
                source_file: raw.source_file,
                compile_command: raw
                    .compile_command
                    .map(|cmd| into_command(&cmd))
                    .filter(|cmd| !cmd.is_empty()),
                run_command,
            };

            // Add main language name
            languages.insert(name.to_lowercase(), config.clone());

            // Add aliases
            for alias in raw.aliases {
                languages.insert(alias.to_lowercase(), config.clone());
            }
        }

        Ok(Self { languages })
    }

    /// Get language configuration by language name or alias
    pub fn get(&self, language: &str) -> Option<&LanguageConfig> {
        self.languages.get(&language.trim().to_lowercase())
    }

    /// Get all supported language names (aliases included)
    pub fn supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.languages.keys().cloned().collect();
        names.sort();
        names
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_table(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_override_table() {
        let file = write_table(
            r#"
[kotlin]
source_file = "Main.kt"
compile_command = "kotlinc Main.kt -include-runtime -d main.jar"
run_command = "java -jar main.jar"
aliases = ["kt"]

[shell]
source_file = "Main.sh"
run_command = "sh Main.sh"
"#,
        );
        let registry = LanguageRegistry::load(file.path()).unwrap();

        let kotlin = registry.get(" KT ").unwrap();
        assert_eq!(kotlin.name, "kotlin");
        assert_eq!(kotlin.source_file, "Main.kt");
        assert_eq!(kotlin.compile_command.as_ref().map(Vec::len), Some(5));
        
        let shell = registry.get("shell").unwrap();
        assert!(shell.compile_command.is_none());
        assert_eq!(registry.supported(), vec!["kotlin", "kt", "shell"]);
    }

    #[test]
    fn test_blank_compile_command_means_none() {
        let registry = LanguageRegistry::from_toml_str(
            r#"
[lua]
source_file = "main.lua"
compile_command = "  "
run_command = "lua main.lua"
"#,
        )
        .unwrap();
        assert_eq!(registry.get("lua").unwrap().compile_command, None);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = LanguageRegistry::load(Path::new("/nonexistent/languages.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read language config"));
    }

    #[test]
    fn test_embedded_java() {
        let registry = LanguageRegistry::embedded().unwrap();
        let java = registry.get("java").unwrap();

        assert_eq!(java.source_file, "Main.java");
        assert!(java.compile_command.is_some());
        assert_eq!(java.run_command.last().map(String::as_str), Some("Main"));
    }

    #[test]
    fn test_rejects_path_in_source_file() {
        let err = LanguageRegistry::from_toml_str(
            r#"
[evil]
source_file = "../Main.java"
run_command = "java Main"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid source file name"));
    }

    #[test]
    fn test_unknown_language() {
        let registry = LanguageRegistry::embedded().unwrap();
        assert!(registry.get("cobol").is_none());
    }
}
