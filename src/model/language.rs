use serde::{Deserialize, Serialize};

use crate::error::{JudgeError, Result};
use crate::proto::judge as pb;

/// How to build and run one submission. Supplied by the client with every
/// submission and never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Language {
    pub name: String,
    pub source_file_name: String,
    pub compile_cmd: String,
    pub run_cmd: String,
    /// Files the compile step produces and every run step needs.
    #[serde(default)]
    pub executables: Vec<String>,
}

impl Language {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("name", &self.name),
            ("sourceFileName", &self.source_file_name),
            ("compileCmd", &self.compile_cmd),
            ("runCmd", &self.run_cmd),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(JudgeError::InvalidRequest(format!(
                    "language {} cannot be empty",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn compile_args(&self) -> Option<Vec<String>> {
        split_command(&self.compile_cmd)
    }

    pub fn run_args(&self) -> Option<Vec<String>> {
        split_command(&self.run_cmd)
    }
}

/// Split a command line the way a POSIX shell would, honouring quotes.
/// Returns `None` for unbalanced quoting or an empty command.
pub fn split_command(cmd: &str) -> Option<Vec<String>> {
    let args = shlex::split(cmd)?;
    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

impl From<pb::Language> for Language {
    fn from(l: pb::Language) -> Self {
        Self {
            name: l.name,
            source_file_name: l.source_file_name,
            compile_cmd: l.compile_cmd,
            run_cmd: l.run_cmd,
            executables: l.executables,
        }
    }
}

impl From<Language> for pb::Language {
    fn from(l: Language) -> Self {
        Self {
            name: l.name,
            source_file_name: l.source_file_name,
            compile_cmd: l.compile_cmd,
            run_cmd: l.run_cmd,
            executables: l.executables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c_language() -> Language {
        Language {
            name: "c".to_string(),
            source_file_name: "a.c".to_string(),
            compile_cmd: "gcc -o a a.c".to_string(),
            run_cmd: "./a".to_string(),
            executables: vec!["a".to_string()],
        }
    }

    #[test]
    fn valid_language_passes() {
        assert!(c_language().validate().is_ok());
    }

    #[test]
    fn blank_fields_are_rejected() {
        let mut lang = c_language();
        lang.run_cmd = "   ".to_string();
        let err = lang.validate().unwrap_err();
        assert!(err.to_string().contains("runCmd"));

        let mut lang = c_language();
        lang.name.clear();
        assert!(lang.validate().is_err());
    }

    #[test]
    fn split_honours_quotes() {
        let lang = Language {
            compile_cmd: r#"/usr/bin/python3 -c "import py_compile; py_compile.compile('a.py')""#
                .to_string(),
            ..c_language()
        };
        let args = lang.compile_args().unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[2], "import py_compile; py_compile.compile('a.py')");
    }

    #[test]
    fn split_rejects_unbalanced_and_empty() {
        assert!(split_command("gcc \"a.c").is_none());
        assert!(split_command("   ").is_none());
        assert_eq!(
            split_command("gcc -o a a.c"),
            Some(vec![
                "gcc".to_string(),
                "-o".to_string(),
                "a".to_string(),
                "a.c".to_string()
            ])
        );
    }

    #[test]
    fn json_uses_camel_case() {
        let json = serde_json::to_value(c_language()).unwrap();
        assert_eq!(json["sourceFileName"], "a.c");
        assert_eq!(json["compileCmd"], "gcc -o a a.c");
    }
}
