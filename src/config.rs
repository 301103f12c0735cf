//! Typed configuration registry with YAML binding.
//!
//! Variables are registered under dotted names (`scheduler.stack_size`),
//! carry a default and a description, and notify monitors after every
//! commit. A YAML document loads by flattening nested maps into dotted
//! names; scalars bind by textual conversion and containers decode
//! recursively.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use yaml_rust::yaml::Hash;
use yaml_rust::{Yaml, YamlEmitter, YamlLoader};

/// default stack size of a worker coroutine
pub const DEFAULT_STACK_SIZE: usize = 0x10_0000; // 1 MiB
const DEFAULT_POOL_CAPACITY: usize = 100;

#[derive(Debug)]
pub enum ConfigError {
    /// variable name does not match `[A-Za-z0-9._]+`
    InvalidName(String),
    /// a variable with this name exists under a different type
    WrongType { name: String, expected: &'static str },
    /// a YAML node could not be decoded into the variable's type
    Decode { expected: &'static str },
    /// the YAML document itself failed to parse or emit
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::InvalidName(name) => {
                write!(f, "invalid config name {:?}, expected [A-Za-z0-9._]+", name)
            }
            ConfigError::WrongType { name, expected } => {
                write!(f, "config variable {:?} is not of type {}", name, expected)
            }
            ConfigError::Decode { expected } => {
                write!(f, "yaml node is not decodable as {}", expected)
            }
            ConfigError::Parse(msg) => write!(f, "yaml error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn scalar_string(node: &Yaml) -> Option<String> {
    match node {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        Yaml::Real(r) => Some(r.clone()),
        Yaml::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Conversion between a variable's type and a YAML node.
///
/// Scalars accept the matching YAML scalar or its textual form;
/// containers decode recursively.
pub trait ConfigValue: Clone + Send + Sync + 'static {
    fn from_yaml(node: &Yaml) -> Result<Self, ConfigError>;
    fn to_yaml(&self) -> Yaml;
}

macro_rules! int_config_value {
    ($($t:ty),*) => {$(
        impl ConfigValue for $t {
            fn from_yaml(node: &Yaml) -> Result<Self, ConfigError> {
                let err = || ConfigError::Decode { expected: stringify!($t) };
                match node {
                    Yaml::Integer(i) => <$t>::try_from(*i).map_err(|_| err()),
                    _ => scalar_string(node)
                        .and_then(|s| s.parse::<$t>().ok())
                        .ok_or_else(err),
                }
            }

            fn to_yaml(&self) -> Yaml {
                Yaml::Integer(*self as i64)
            }
        }
    )*};
}

int_config_value!(i32, i64, u16, u32, u64, usize);

impl ConfigValue for bool {
    fn from_yaml(node: &Yaml) -> Result<Self, ConfigError> {
        match node {
            Yaml::Boolean(b) => Ok(*b),
            _ => scalar_string(node)
                .and_then(|s| s.parse::<bool>().ok())
                .ok_or(ConfigError::Decode { expected: "bool" }),
        }
    }

    fn to_yaml(&self) -> Yaml {
        Yaml::Boolean(*self)
    }
}

impl ConfigValue for f64 {
    fn from_yaml(node: &Yaml) -> Result<Self, ConfigError> {
        match node {
            Yaml::Real(r) => r.parse().map_err(|_| ConfigError::Decode { expected: "f64" }),
            Yaml::Integer(i) => Ok(*i as f64),
            _ => scalar_string(node)
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or(ConfigError::Decode { expected: "f64" }),
        }
    }

    fn to_yaml(&self) -> Yaml {
        let mut s = format!("{}", self);
        if !s.contains('.') && !s.contains('e') {
            s.push_str(".0");
        }
        Yaml::Real(s)
    }
}

impl ConfigValue for String {
    fn from_yaml(node: &Yaml) -> Result<Self, ConfigError> {
        scalar_string(node).ok_or(ConfigError::Decode { expected: "string" })
    }

    fn to_yaml(&self) -> Yaml {
        Yaml::String(self.clone())
    }
}

impl<T: ConfigValue> ConfigValue for Vec<T> {
    fn from_yaml(node: &Yaml) -> Result<Self, ConfigError> {
        match node {
            Yaml::Array(items) => items.iter().map(T::from_yaml).collect(),
            _ => Err(ConfigError::Decode { expected: "sequence" }),
        }
    }

    fn to_yaml(&self) -> Yaml {
        Yaml::Array(self.iter().map(T::to_yaml).collect())
    }
}

impl<T: ConfigValue> ConfigValue for HashMap<String, T> {
    fn from_yaml(node: &Yaml) -> Result<Self, ConfigError> {
        match node {
            Yaml::Hash(h) => {
                let mut out = HashMap::with_capacity(h.len());
                for (k, v) in h {
                    let key = match k {
                        Yaml::String(s) => s.clone(),
                        _ => return Err(ConfigError::Decode { expected: "string key" }),
                    };
                    out.insert(key, T::from_yaml(v)?);
                }
                Ok(out)
            }
            _ => Err(ConfigError::Decode { expected: "mapping" }),
        }
    }

    fn to_yaml(&self) -> Yaml {
        // emit keys sorted so a dump is deterministic
        let mut keys: Vec<&String> = self.keys().collect();
        keys.sort();
        let mut h = Hash::new();
        for k in keys {
            h.insert(Yaml::String(k.clone()), self[k].to_yaml());
        }
        Yaml::Hash(h)
    }
}

type Monitor<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A named, typed configuration variable.
pub struct ConfigVar<T: ConfigValue> {
    name: String,
    description: String,
    default: T,
    value: RwLock<T>,
    monitors: Mutex<HashMap<u64, Monitor<T>>>,
    next_monitor_key: AtomicU64,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: String, default: T, description: String) -> Self {
        ConfigVar {
            value: RwLock::new(default.clone()),
            default,
            name,
            description,
            monitors: Mutex::new(HashMap::new()),
            next_monitor_key: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub fn get(&self) -> T {
        self.value.read().unwrap().clone()
    }

    /// Commits a new value, then invokes every monitor with the old and
    /// new values.
    pub fn set(&self, new: T) {
        let old = {
            let mut guard = self.value.write().unwrap();
            std::mem::replace(&mut *guard, new.clone())
        };
        let monitors = self.monitors.lock().unwrap();
        for m in monitors.values() {
            m(&old, &new);
        }
    }

    /// Registers a change listener; returns a key usable with
    /// [`del_monitor`](ConfigVar::del_monitor).
    pub fn add_monitor<F>(&self, f: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let key = self.next_monitor_key.fetch_add(1, Ordering::Relaxed);
        self.monitors.lock().unwrap().insert(key, Box::new(f));
        key
    }

    pub fn del_monitor(&self, key: u64) {
        self.monitors.lock().unwrap().remove(&key);
    }
}

trait AnyVar: Send + Sync {
    fn load_from_yaml(&self, node: &Yaml) -> Result<(), ConfigError>;
    fn dump_yaml(&self) -> Yaml;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: ConfigValue> AnyVar for ConfigVar<T> {
    fn load_from_yaml(&self, node: &Yaml) -> Result<(), ConfigError> {
        self.set(T::from_yaml(node)?);
        Ok(())
    }

    fn dump_yaml(&self) -> Yaml {
        self.get().to_yaml()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_owned()))
    }
}

/// Registry of named variables; loads and dumps YAML documents.
#[derive(Default)]
pub struct ConfigRegistry {
    vars: RwLock<HashMap<String, Arc<dyn AnyVar>>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` with the given default, or retrieves the
    /// existing variable of the same type.
    pub fn lookup<T: ConfigValue>(
        &self,
        name: &str,
        default: T,
        description: &str,
    ) -> Result<Arc<ConfigVar<T>>, ConfigError> {
        validate_name(name)?;
        {
            let vars = self.vars.read().unwrap();
            if let Some(var) = vars.get(name) {
                return var
                    .clone()
                    .as_any_arc()
                    .downcast::<ConfigVar<T>>()
                    .map_err(|_| ConfigError::WrongType {
                        name: name.to_owned(),
                        expected: std::any::type_name::<T>(),
                    });
            }
        }
        let mut vars = self.vars.write().unwrap();
        // lost the race? someone else may have inserted meanwhile
        if let Some(var) = vars.get(name) {
            return var
                .clone()
                .as_any_arc()
                .downcast::<ConfigVar<T>>()
                .map_err(|_| ConfigError::WrongType {
                    name: name.to_owned(),
                    expected: std::any::type_name::<T>(),
                });
        }
        let var = Arc::new(ConfigVar::new(
            name.to_owned(),
            default,
            description.to_owned(),
        ));
        vars.insert(name.to_owned(), var.clone());
        debug!("config variable registered, name={}", name);
        Ok(var)
    }

    /// Loads every document in `text`, binding nodes to variables by
    /// flattened dotted name. Names with no registered variable are
    /// skipped.
    pub fn load_yaml_str(&self, text: &str) -> Result<(), ConfigError> {
        let docs =
            YamlLoader::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        for doc in &docs {
            self.load_node("", doc)?;
        }
        Ok(())
    }

    fn load_node(&self, prefix: &str, node: &Yaml) -> Result<(), ConfigError> {
        if !prefix.is_empty() {
            let var = self.vars.read().unwrap().get(prefix).cloned();
            if let Some(var) = var {
                var.load_from_yaml(node)?;
                info!("config variable {} loaded from yaml", prefix);
            }
        }
        if let Yaml::Hash(h) = node {
            for (k, v) in h {
                if let Yaml::String(key) = k {
                    let name = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    self.load_node(&name, v)?;
                }
            }
        }
        Ok(())
    }

    /// Dumps every variable as a flat mapping of dotted name to value.
    pub fn dump_yaml(&self) -> Yaml {
        let vars = self.vars.read().unwrap();
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();
        let mut h = Hash::new();
        for name in names {
            h.insert(Yaml::String(name.clone()), vars[name].dump_yaml());
        }
        Yaml::Hash(h)
    }

    pub fn dump_yaml_str(&self) -> Result<String, ConfigError> {
        let mut out = String::new();
        YamlEmitter::new(&mut out)
            .dump(&self.dump_yaml())
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(out)
    }
}

/// The process-wide registry the runtime's own knobs live in.
pub fn global() -> &'static ConfigRegistry {
    static GLOBAL: OnceLock<ConfigRegistry> = OnceLock::new();
    GLOBAL.get_or_init(ConfigRegistry::new)
}

struct RuntimeVars {
    stack_size: Arc<ConfigVar<usize>>,
    pool_capacity: Arc<ConfigVar<usize>>,
}

fn runtime() -> &'static RuntimeVars {
    static RUNTIME: OnceLock<RuntimeVars> = OnceLock::new();
    RUNTIME.get_or_init(|| RuntimeVars {
        stack_size: global()
            .lookup(
                "scheduler.stack_size",
                DEFAULT_STACK_SIZE,
                "stack size of a worker coroutine in bytes",
            )
            .expect("builtin config name is valid"),
        pool_capacity: global()
            .lookup(
                "scheduler.pool_capacity",
                DEFAULT_POOL_CAPACITY,
                "number of finished coroutine stacks kept for reuse",
            )
            .expect("builtin config name is valid"),
    })
}

/// default coroutine stack size, overridable through the registry
pub fn stack_size() -> usize {
    runtime().stack_size.get()
}

pub(crate) fn pool_capacity() -> usize {
    runtime().pool_capacity.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_must_match_charset() {
        let reg = ConfigRegistry::new();
        assert!(matches!(
            reg.lookup::<u32>("bad name!", 0, ""),
            Err(ConfigError::InvalidName(_))
        ));
        assert!(reg.lookup::<u32>("fine.name_0", 0, "").is_ok());
    }

    #[test]
    fn lookup_is_typed() {
        let reg = ConfigRegistry::new();
        reg.lookup::<u32>("port", 80, "").unwrap();
        assert!(matches!(
            reg.lookup::<String>("port", String::new(), ""),
            Err(ConfigError::WrongType { .. })
        ));
    }

    #[test]
    fn monitors_fire_after_commit() {
        let reg = ConfigRegistry::new();
        let var = reg.lookup::<u32>("workers", 4, "").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let key = var.add_monitor(move |old, new| s.lock().unwrap().push((*old, *new)));
        var.set(8);
        var.del_monitor(key);
        var.set(2);
        assert_eq!(*seen.lock().unwrap(), vec![(4, 8)]);
        assert_eq!(var.get(), 2);
    }

    #[test]
    fn yaml_load_binds_scalars_and_containers() {
        let reg = ConfigRegistry::new();
        let port = reg.lookup::<u16>("server.port", 0, "").unwrap();
        let hosts = reg.lookup::<Vec<String>>("server.hosts", Vec::new(), "").unwrap();
        let weights = reg
            .lookup::<HashMap<String, u32>>("server.weights", HashMap::new(), "")
            .unwrap();

        reg.load_yaml_str(
            "server:\n  port: \"8080\"\n  hosts:\n    - a.example\n    - b.example\n  weights:\n    a: 1\n    b: 2\n",
        )
        .unwrap();

        assert_eq!(port.get(), 8080);
        assert_eq!(hosts.get(), vec!["a.example".to_owned(), "b.example".to_owned()]);
        assert_eq!(weights.get().get("b"), Some(&2));
    }

    // encode(decode(doc)) == doc for every supported container
    #[test]
    fn yaml_round_trip() {
        fn round_trip<T: ConfigValue + PartialEq + std::fmt::Debug>(doc: &str) {
            let parsed = &YamlLoader::load_from_str(doc).unwrap()[0];
            let value = T::from_yaml(parsed).unwrap();
            assert_eq!(&value.to_yaml(), parsed);
            // and decoding the re-encoded node yields the same value
            assert_eq!(T::from_yaml(&value.to_yaml()).unwrap(), value);
        }

        round_trip::<i64>("42");
        round_trip::<bool>("true");
        round_trip::<String>("\"hello\"");
        round_trip::<Vec<i64>>("[1, 2, 3]");
        round_trip::<Vec<Vec<i64>>>("[[1], [2, 3]]");
        round_trip::<HashMap<String, i64>>("{a: 1, b: 2}");
        round_trip::<HashMap<String, Vec<String>>>("{k: [x, y]}");
    }
}
