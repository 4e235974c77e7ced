use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

const TOP_LEVEL_TABLES: [&str; 6] = ["build", "workspace", "engine", "http", "images", "packages"];

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn table(&self, key: &str) -> Option<&toml::value::Table> {
        self.value.as_table().and_then(|t| t.get(key)?.as_table())
    }

    pub fn has_table(&self, key: &str) -> bool {
        self.table(key).is_some()
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    pub fn section<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        Ok(self.deserialize_path(key)?.unwrap_or_default())
    }

    /// Reject top-level keys this tool does not understand.
    pub fn validate(&self) -> Result<()> {
        let Some(root) = self.value.as_table() else {
            return Err(Error::msg(format!(
                "{} is not a TOML table",
                self.path.display()
            )));
        };
        for key in root.keys() {
            if !TOP_LEVEL_TABLES.contains(&key.as_str()) {
                return Err(Error::msg(format!(
                    "unknown config table '{}' in {} (expected one of: {})",
                    key,
                    self.path.display(),
                    TOP_LEVEL_TABLES.join(", ")
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BuildMeta {
    /// `KEY=VALUE` file providing `{version}` and `{short_version}`.
    pub version_file: Option<String>,
    /// Image used to build packages that do not name one.
    pub builder: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub program: Option<String>,
}

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    pub version: String,
    pub dockerfile: String,
    pub destination: Option<String>,
    pub save_on_disk: bool,
    pub file_dep: Vec<String>,
    pub build_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    pub version: String,
    pub build_id: u32,
    pub sources: Vec<String>,
    pub builder: Option<String>,
    /// Overrides `packages/<name>.spec`.
    pub spec: Option<String>,
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

// Imported files form the base; keys of the importing table win.
fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = parse_imports(file_path, tbl)?;
    tbl.remove("imports");
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value(&resolve_ref_path(file_path, &imp), stack)?;
            merge_values(&mut acc, loaded);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value(&resolve_ref_path(path, ext), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    inline_imports(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value(path, &mut stack)?;
    let doc = ConfigDoc {
        path: path.to_path_buf(),
        value,
    };
    doc.validate()?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_tables() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[workspace]\nbuild_dir = \"_build\"\n[images.builder]\nversion = \"1\"\ndockerfile = \"a/Dockerfile\"\n",
        )
        .unwrap();
        fs::write(
            tmp.path().join("pkgs.toml"),
            "[calico]\nversion = \"3.5.1\"\nbuild_id = 1\nsources = [\"v3.5.1.tar.gz\"]\n",
        )
        .unwrap();
        let main = tmp.path().join("main.toml");
        fs::write(
            &main,
            "extends = \"base.toml\"\n[images.builder]\nversion = \"2\"\n[packages]\nimports = [\"pkgs.toml\"]\n",
        )
        .unwrap();

        let doc = load(&main).unwrap();
        let img: ImageConfig = doc.deserialize_path("images.builder").unwrap().unwrap();
        assert_eq!(img.version, "2");
        assert_eq!(img.dockerfile, "a/Dockerfile");
        let pkg: PackageConfig = doc.deserialize_path("packages.calico").unwrap().unwrap();
        assert_eq!(pkg.sources, vec!["v3.5.1.tar.gz".to_string()]);
        assert!(doc.value_path("packages.imports").is_none());
    }

    #[test]
    fn rejects_unknown_tables_and_cycles() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bad = tmp.path().join("bad.toml");
        fs::write(&bad, "[salt]\nenabled = true\n").unwrap();
        let err = load(&bad).unwrap_err().to_string();
        assert!(err.contains("unknown config table 'salt'"), "{err}");

        let a = tmp.path().join("a.toml");
        fs::write(&a, "extends = \"b.toml\"\n").unwrap();
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").unwrap();
        let err = load(&a).unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
    }

    #[test]
    fn http_timeout_defaults() {
        let doc = ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str("[http]\n").unwrap(),
        };
        let http: HttpConfig = doc.section("http").unwrap();
        assert_eq!(http.timeout_secs, 300);
    }
}
