//! Default inspector: recognizes the runtime of an executable from its file.
//!
//! - Interpreters and managed runtimes are matched by executable file name
//!   (`python3.11`, `java`, `node`, ...).
//! - Go binaries are recognized by their build-info or pclntab sections, and
//!   the addresses of the configured Go symbols become the runtime offsets.
//! - Any other parseable object file is `Generic`.

use std::{collections::HashMap, fs::File, path::Path};

use anyhow::{Context, Result, bail};
use log::debug;
use memmap2::Mmap;
use object::{Object, ObjectSymbol};
use once_cell::sync::Lazy;
use proctyper_common::{MAX_OFFSETS, RuntimeKind, RuntimeOffsets};
use regex::Regex;

use super::{ExecutableInfo, Inspection, Inspector};
use crate::settings::TyperConfig;

static RUNTIME_PATTERNS: Lazy<Vec<(Regex, RuntimeKind)>> = Lazy::new(|| {
    [
        (r"^python(\d+(\.\d+)?)?$", RuntimeKind::Python),
        (r"^(java|javaw)$", RuntimeKind::Java),
        (r"^(node|nodejs)$", RuntimeKind::NodeJs),
        (r"^ruby(\d+(\.\d+)?)?$", RuntimeKind::Ruby),
        (r"^dotnet$", RuntimeKind::DotNet),
    ]
    .into_iter()
    .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
    .collect()
});

const GO_SECTIONS: [&str; 2] = [".go.buildinfo", ".gopclntab"];

pub struct ElfInspector {
    max_file_size: u64,
    go_symbols: Vec<String>,
}

impl ElfInspector {
    pub fn new(config: &TyperConfig) -> Self {
        Self::with_symbols(config.max_file_size, config.go_symbols.clone())
    }

    pub fn with_symbols(max_file_size: u64, mut go_symbols: Vec<String>) -> Self {
        go_symbols.truncate(MAX_OFFSETS);
        Self {
            max_file_size,
            go_symbols,
        }
    }

    fn inspect_path(&self, path: &Path, file_name: Option<&str>) -> Result<Inspection> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        if size == 0 {
            bail!("{} is empty", path.display());
        }
        if size > self.max_file_size {
            bail!(
                "{} is {} bytes, above the {} byte inspection limit",
                path.display(),
                size,
                self.max_file_size
            );
        }

        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map {}", path.display()))?;
        let obj = object::File::parse(&*mmap)
            .with_context(|| format!("{} is not an object file", path.display()))?;

        if let Some(kind) = file_name.and_then(runtime_from_name) {
            return Ok(Inspection {
                kind,
                offsets: None,
            });
        }

        if GO_SECTIONS
            .iter()
            .any(|name| obj.section_by_name(name).is_some())
        {
            let offsets = self.go_offsets(&obj);
            debug!(
                "Go binary {}: resolved {}/{} symbols",
                path.display(),
                offsets.as_slice().iter().filter(|o| **o != 0).count(),
                self.go_symbols.len()
            );
            return Ok(Inspection {
                kind: RuntimeKind::Go,
                offsets: Some(offsets),
            });
        }

        Ok(Inspection {
            kind: RuntimeKind::Generic,
            offsets: None,
        })
    }

    fn go_offsets(&self, obj: &object::File<'_>) -> RuntimeOffsets {
        let mut wanted: HashMap<&str, u64> =
            self.go_symbols.iter().map(|s| (s.as_str(), 0)).collect();

        for sym in obj.symbols() {
            if let Ok(name) = sym.name()
                && let Some(addr) = wanted.get_mut(name)
            {
                *addr = sym.address();
            }
        }

        let mut offsets = RuntimeOffsets::default();
        for name in &self.go_symbols {
            offsets.push(wanted.get(name.as_str()).copied().unwrap_or(0));
        }
        offsets
    }
}

impl Inspector for ElfInspector {
    fn inspect(&self, exe: &ExecutableInfo) -> Result<Inspection> {
        self.inspect_path(&exe.open_path(), exe.file_name())
    }
}

fn runtime_from_name(file_name: &str) -> Option<RuntimeKind> {
    RUNTIME_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(file_name))
        .map(|(_, kind)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn inspector() -> ElfInspector {
        ElfInspector::with_symbols(512 * 1024 * 1024, vec!["runtime.main".to_string()])
    }

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("proctyper-{}-{}", std::process::id(), name));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_runtime_from_name() {
        assert_eq!(runtime_from_name("python3.11"), Some(RuntimeKind::Python));
        assert_eq!(runtime_from_name("python"), Some(RuntimeKind::Python));
        assert_eq!(runtime_from_name("java"), Some(RuntimeKind::Java));
        assert_eq!(runtime_from_name("node"), Some(RuntimeKind::NodeJs));
        assert_eq!(runtime_from_name("ruby3.2"), Some(RuntimeKind::Ruby));
        assert_eq!(runtime_from_name("dotnet"), Some(RuntimeKind::DotNet));
        assert_eq!(runtime_from_name("nginx"), None);
        assert_eq!(runtime_from_name("python-config"), None);
    }

    #[test]
    fn test_inspect_own_binary() {
        let exe = std::env::current_exe().unwrap();
        let inspection = inspector().inspect_path(&exe, Some("proctyper-test")).unwrap();
        assert_eq!(inspection.kind, RuntimeKind::Generic);
        assert!(inspection.offsets.is_none());
    }

    #[test]
    fn test_name_match_overrides_sections() {
        let exe = std::env::current_exe().unwrap();
        let inspection = inspector().inspect_path(&exe, Some("python3")).unwrap();
        assert_eq!(inspection.kind, RuntimeKind::Python);
    }

    #[test]
    fn test_non_object_file_fails() {
        let path = temp_file("script.sh", b"#!/bin/sh\necho hello\n");
        let result = inspector().inspect_path(&path, Some("script.sh"));
        std::fs::remove_file(&path).ok();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("not an object file"));
    }

    #[test]
    fn test_oversized_file_fails() {
        let path = temp_file("big.bin", &[0x7f; 64]);
        let small = ElfInspector::with_symbols(16, Vec::new());
        let result = small.inspect_path(&path, None);
        std::fs::remove_file(&path).ok();

        assert!(result.unwrap_err().to_string().contains("inspection limit"));
    }

    #[test]
    fn test_missing_file_fails() {
        let result = inspector().inspect_path(Path::new("/nonexistent/proctyper/bin"), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_symbol_list_truncated_to_capacity() {
        let symbols = (0..MAX_OFFSETS + 4).map(|i| format!("main.f{}", i)).collect();
        let inspector = ElfInspector::with_symbols(1024, symbols);
        assert_eq!(inspector.go_symbols.len(), MAX_OFFSETS);
    }
}
