//! Function descriptors and invocation contexts.
//!
//! The host does not parse function configuration files. A
//! [`FunctionMetadataProvider`] hands the dispatcher an ordered list of
//! [`FunctionDescriptor`]s; [`DirectoryMetadataProvider`] is the minimal
//! provider used by the binary, treating every sub-directory of the app root
//! that holds a recognizable entry point as one function.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stratus_rpc_core::{
    Result,
    Error,
    proto::{ParameterBinding, RpcFunctionMetadata, RpcTraceContext, TypedData},
    types::{FunctionId, InvocationId},
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub id: FunctionId,
    pub name: String,
    /// Empty when the language could not be inferred; such functions are
    /// never dispatched.
    pub language: String,
    pub trigger_kind: String,
    pub is_disabled: bool,
    pub directory: PathBuf,
    pub script_file: PathBuf,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            language: language.into(),
            trigger_kind: "httpTrigger".to_string(),
            is_disabled: false,
            directory: PathBuf::new(),
            script_file: PathBuf::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.is_disabled = true;
        self
    }

    pub fn with_trigger(mut self, trigger_kind: impl Into<String>) -> Self {
        self.trigger_kind = trigger_kind.into();
        self
    }

    pub fn with_script(mut self, directory: PathBuf, script_file: PathBuf) -> Self {
        self.directory = directory;
        self.script_file = script_file;
        self
    }

    pub fn to_rpc_metadata(&self) -> RpcFunctionMetadata {
        RpcFunctionMetadata {
            name: self.name.clone(),
            directory: self.directory.display().to_string(),
            script_file: self.script_file.display().to_string(),
            language: self.language.clone(),
            is_disabled: self.is_disabled,
            trigger_kind: self.trigger_kind.clone(),
        }
    }
}

/// Directory and trace context an invocation runs with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionMetadata {
    pub directory: PathBuf,
    pub trace_context: Option<RpcTraceContext>,
}

/// One call of one function. Consumed by exactly one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext {
    pub invocation_id: InvocationId,
    pub function_id: FunctionId,
    pub function_name: String,
    pub language: String,
    pub inputs: Vec<ParameterBinding>,
    pub trigger_metadata: HashMap<String, TypedData>,
    pub execution: ExecutionMetadata,
}

impl InvocationContext {
    pub fn new(function: &FunctionDescriptor, inputs: Vec<ParameterBinding>) -> Self {
        Self {
            invocation_id: Uuid::new_v4().to_string(),
            function_id: function.id.clone(),
            function_name: function.name.clone(),
            language: function.language.clone(),
            inputs,
            trigger_metadata: HashMap::new(),
            execution: ExecutionMetadata {
                directory: function.directory.clone(),
                trace_context: None,
            },
        }
    }
}

pub trait FunctionMetadataProvider: Send + Sync {
    fn functions(&self, app_directory: &Path) -> Result<Vec<FunctionDescriptor>>;
}

/// Entry-point file names and the language they imply.
const ENTRY_POINTS: &[(&str, &str)] = &[
    ("index.js", "node"),
    ("index.mjs", "node"),
    ("__init__.py", "python"),
    ("run.ps1", "powershell"),
    ("function.jar", "java"),
    ("run.csx", "dotnet"),
];

/// Infers a language from a script file name.
pub fn language_for_script(file_name: &str) -> Option<&'static str> {
    if let Some((_, language)) = ENTRY_POINTS.iter().find(|(name, _)| *name == file_name) {
        return Some(language);
    }
    match Path::new(file_name).extension()?.to_str()? {
        "js" | "mjs" | "cjs" => Some("node"),
        "py" => Some("python"),
        "ps1" | "psm1" => Some("powershell"),
        "jar" => Some("java"),
        "dll" | "csx" => Some("dotnet"),
        _ => None,
    }
}

/// Treats each sub-directory with a known entry point as a function. A
/// `disabled` marker file disables it.
#[derive(Debug, Clone, Default)]
pub struct DirectoryMetadataProvider;

impl FunctionMetadataProvider for DirectoryMetadataProvider {
    fn functions(&self, app_directory: &Path) -> Result<Vec<FunctionDescriptor>> {
        let entries = match std::fs::read_dir(app_directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::InvalidRequest {
                    reason: format!("cannot read {}: {e}", app_directory.display()),
                });
            }
        };

        let mut directories: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        directories.sort();

        let mut functions = Vec::new();
        for directory in directories {
            let Some(name) = directory.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            let script = ENTRY_POINTS
                .iter()
                .map(|(file, _)| directory.join(file))
                .find(|path| path.is_file());
            let Some(script) = script else {
                tracing::debug!(directory = %directory.display(), "no entry point, skipping");
                continue;
            };
            let language = script
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(language_for_script)
                .unwrap_or_default();

            let mut function = FunctionDescriptor::new(name, language)
                .with_script(directory.clone(), script);
            if directory.join("disabled").exists() {
                function = function.disabled();
            }
            functions.push(function);
        }
        Ok(functions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_language_from_script() {
        assert_eq!(language_for_script("index.js"), Some("node"));
        assert_eq!(language_for_script("__init__.py"), Some("python"));
        assert_eq!(language_for_script("handler.ps1"), Some("powershell"));
        assert_eq!(language_for_script("run.csx"), Some("dotnet"));
        assert_eq!(language_for_script("README.md"), None);
    }

    #[test]
    fn descriptors_get_distinct_ids() {
        let a = FunctionDescriptor::new("a", "node");
        let b = FunctionDescriptor::new("a", "node");
        assert_ne!(a.id, b.id);
        let ctx1 = InvocationContext::new(&a, Vec::new());
        let ctx2 = InvocationContext::new(&a, Vec::new());
        assert_ne!(ctx1.invocation_id, ctx2.invocation_id);
        assert_eq!(ctx1.function_id, a.id);
    }

    #[test]
    fn discovers_functions_in_app_directory() {
        let root = tempfile::tempdir().unwrap();
        let http = root.path().join("HttpTrigger");
        std::fs::create_dir(&http).unwrap();
        std::fs::write(http.join("index.js"), "module.exports = {}").unwrap();

        let timer = root.path().join("Timer");
        std::fs::create_dir(&timer).unwrap();
        std::fs::write(timer.join("__init__.py"), "").unwrap();
        std::fs::write(timer.join("disabled"), "").unwrap();

        std::fs::create_dir(root.path().join("node_modules")).unwrap();

        let functions = DirectoryMetadataProvider.functions(root.path()).unwrap();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "HttpTrigger");
        assert_eq!(functions[0].language, "node");
        assert!(!functions[0].is_disabled);
        assert_eq!(functions[1].name, "Timer");
        assert_eq!(functions[1].language, "python");
        assert!(functions[1].is_disabled);
    }

    #[test]
    fn missing_app_directory_has_no_functions() {
        let functions = DirectoryMetadataProvider
            .functions(Path::new("/definitely/not/here"))
            .unwrap();
        assert!(functions.is_empty());
    }
}
