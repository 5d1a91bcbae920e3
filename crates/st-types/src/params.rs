//! Parameter specifications and resolved trial parameters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::capability::ParameterSampler;
use crate::errors::{TunerError, TunerResult};

/// Integer sampling range `[low, high]`, inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntRange {
    pub low: i64,
    pub high: i64,
    #[serde(default = "default_int_step")]
    pub step: i64,
    #[serde(default)]
    pub log: bool,
}

fn default_int_step() -> i64 {
    1
}

impl IntRange {
    pub fn new(low: i64, high: i64) -> Self {
        Self {
            low,
            high,
            step: 1,
            log: false,
        }
    }

    fn validate(&self, name: &str) -> TunerResult<()> {
        if self.low > self.high {
            return Err(config_error!(
                "parameter '{}': low ({}) is greater than high ({})",
                name,
                self.low,
                self.high
            ));
        }
        if self.step < 1 {
            return Err(config_error!("parameter '{}': step must be positive", name));
        }
        if self.log && (self.low < 1 || self.step != 1) {
            return Err(config_error!(
                "parameter '{}': log sampling needs low >= 1 and step == 1",
                name
            ));
        }
        Ok(())
    }
}

/// Real-valued sampling range `[low, high]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub low: f64,
    pub high: f64,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub log: bool,
}

impl FloatRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            step: None,
            log: false,
        }
    }

    fn validate(&self, name: &str) -> TunerResult<()> {
        if !self.low.is_finite() || !self.high.is_finite() || self.low > self.high {
            return Err(config_error!(
                "parameter '{}': invalid range [{}, {}]",
                name,
                self.low,
                self.high
            ));
        }
        if let Some(step) = self.step {
            if !(step > 0.0) {
                return Err(config_error!("parameter '{}': step must be positive", name));
            }
            if self.log {
                return Err(config_error!(
                    "parameter '{}': step and log cannot both be set",
                    name
                ));
            }
        }
        if self.log && self.low <= 0.0 {
            return Err(config_error!(
                "parameter '{}': log sampling needs low > 0",
                name
            ));
        }
        Ok(())
    }
}

/// How a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterKind {
    Int(IntRange),
    Float(FloatRange),
    Categorical { choices: Vec<Value> },
}

/// A single named parameter in the spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

impl ParameterDef {
    pub fn validate(&self) -> TunerResult<()> {
        match &self.kind {
            ParameterKind::Int(range) => range.validate(&self.name),
            ParameterKind::Float(range) => range.validate(&self.name),
            ParameterKind::Categorical { choices } => {
                if choices.is_empty() {
                    Err(config_error!(
                        "parameter '{}': categorical needs at least one choice",
                        self.name
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Declarative parameter description as written in a config file:
/// a kind name plus positional and keyword sampling arguments.
///
/// ```toml
/// [[parameters]]
/// name = "learning_rate"
/// kind = "float"
/// args = [1e-5, 1e-1]
/// kwargs = { log = true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDecl {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TryFrom<ParameterDecl> for ParameterDef {
    type Error = TunerError;

    fn try_from(decl: ParameterDecl) -> TunerResult<Self> {
        let mut args = DeclArgs::new(&decl);
        let kind = match decl.kind.as_str() {
            "int" | "integer" => {
                let low = args.int(0, "low")?;
                let high = args.int(1, "high")?;
                let step = args.optional_int(2, "step")?.unwrap_or(1);
                let log = args.optional_bool("log")?.unwrap_or(false);
                ParameterKind::Int(IntRange {
                    low,
                    high,
                    step,
                    log,
                })
            }
            "float" | "real" => {
                let low = args.float(0, "low")?;
                let high = args.float(1, "high")?;
                let step = args.optional_float(2, "step")?;
                let log = args.optional_bool("log")?.unwrap_or(false);
                ParameterKind::Float(FloatRange {
                    low,
                    high,
                    step,
                    log,
                })
            }
            "categorical" => ParameterKind::Categorical {
                choices: args.choices()?,
            },
            other => {
                return Err(config_error!(
                    "parameter '{}': unknown parameter kind '{}'",
                    decl.name,
                    other
                ))
            }
        };
        args.finish()?;

        let def = ParameterDef {
            name: decl.name,
            kind,
        };
        def.validate()?;
        Ok(def)
    }
}

/// Positional/keyword argument reader used while lowering a [`ParameterDecl`].
struct DeclArgs<'a> {
    name: &'a str,
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
    consumed: HashSet<&'static str>,
    positional_slots: usize,
}

impl<'a> DeclArgs<'a> {
    fn new(decl: &'a ParameterDecl) -> Self {
        Self {
            name: &decl.name,
            args: &decl.args,
            kwargs: &decl.kwargs,
            consumed: HashSet::new(),
            positional_slots: 0,
        }
    }

    fn lookup(&mut self, pos: Option<usize>, key: &'static str) -> TunerResult<Option<&'a Value>> {
        self.consumed.insert(key);
        if let Some(i) = pos {
            self.positional_slots = self.positional_slots.max(i + 1);
        }
        let positional = pos.and_then(|i| self.args.get(i));
        match (positional, self.kwargs.get(key)) {
            (Some(_), Some(_)) => Err(config_error!(
                "parameter '{}': '{}' given both positionally and by keyword",
                self.name,
                key
            )),
            (Some(v), None) | (None, Some(v)) => Ok(Some(v)),
            (None, None) => Ok(None),
        }
    }

    fn optional_int(&mut self, pos: usize, key: &'static str) -> TunerResult<Option<i64>> {
        match self.lookup(Some(pos), key)? {
            None => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| {
                config_error!("parameter '{}': '{}' must be an integer, got {}", self.name, key, v)
            }),
        }
    }

    fn int(&mut self, pos: usize, key: &'static str) -> TunerResult<i64> {
        self.optional_int(pos, key)?
            .ok_or_else(|| config_error!("parameter '{}': missing '{}'", self.name, key))
    }

    fn optional_float(&mut self, pos: usize, key: &'static str) -> TunerResult<Option<f64>> {
        match self.lookup(Some(pos), key)? {
            None => Ok(None),
            Some(v) => v.as_f64().map(Some).ok_or_else(|| {
                config_error!("parameter '{}': '{}' must be a number, got {}", self.name, key, v)
            }),
        }
    }

    fn float(&mut self, pos: usize, key: &'static str) -> TunerResult<f64> {
        self.optional_float(pos, key)?
            .ok_or_else(|| config_error!("parameter '{}': missing '{}'", self.name, key))
    }

    fn optional_bool(&mut self, key: &'static str) -> TunerResult<Option<bool>> {
        match self.lookup(None, key)? {
            None => Ok(None),
            Some(v) => v.as_bool().map(Some).ok_or_else(|| {
                config_error!("parameter '{}': '{}' must be a boolean, got {}", self.name, key, v)
            }),
        }
    }

    fn choices(&mut self) -> TunerResult<Vec<Value>> {
        match self.lookup(Some(0), "choices")? {
            Some(Value::Array(values)) => Ok(values.clone()),
            Some(other) => Err(config_error!(
                "parameter '{}': choices must be a list, got {}",
                self.name,
                other
            )),
            None => Err(config_error!("parameter '{}': missing 'choices'", self.name)),
        }
    }

    /// Reject leftovers so a typo in a keyword never silently changes sampling.
    fn finish(self) -> TunerResult<()> {
        if self.args.len() > self.positional_slots {
            return Err(config_error!(
                "parameter '{}': too many positional arguments ({})",
                self.name,
                self.args.len()
            ));
        }
        if let Some(unknown) = self.kwargs.keys().find(|k| !self.consumed.contains(k.as_str())) {
            return Err(config_error!(
                "parameter '{}': unexpected keyword argument '{}'",
                self.name,
                unknown
            ));
        }
        Ok(())
    }
}

/// A concrete parameter value chosen for a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Categorical(Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Categorical(v) => v.as_f64(),
        }
    }
}

/// Renders the value the way it is passed on a submission command line.
impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            // Debug keeps the decimal point on whole floats (1.0, not 1).
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Categorical(Value::String(s)) => f.write_str(s),
            Self::Categorical(v) => write!(f, "{v}"),
        }
    }
}

/// Parameter values for one trial, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    entries: Vec<(String, ParameterValue)>,
}

impl TrialParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &ParameterValue> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for TrialParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}

/// The full parameter spec for a run: an ordered list of definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub parameters: Vec<ParameterDef>,
}

impl ParameterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower declarative descriptions into a validated spec.
    pub fn from_decls(decls: Vec<ParameterDecl>) -> TunerResult<Self> {
        let parameters = decls
            .into_iter()
            .map(ParameterDef::try_from)
            .collect::<TunerResult<Vec<_>>>()?;
        let spec = Self { parameters };
        spec.validate()?;
        Ok(spec)
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Int(IntRange::new(low, high)),
        });
        self
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Float(FloatRange::new(low, high)),
        });
        self
    }

    pub fn add_log_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Float(FloatRange {
                log: true,
                ..FloatRange::new(low, high)
            }),
        });
        self
    }

    pub fn add_categorical(mut self, name: impl Into<String>, choices: Vec<Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Categorical { choices },
        });
        self
    }

    pub fn validate(&self) -> TunerResult<()> {
        let mut seen = HashSet::new();
        for def in &self.parameters {
            if !seen.insert(def.name.as_str()) {
                return Err(config_error!("duplicate parameter '{}'", def.name));
            }
            def.validate()?;
        }
        Ok(())
    }

    /// Sample every declared parameter through `sampler`.
    ///
    /// The whole spec is validated before the sampler sees anything, so a bad
    /// spec fails without consuming suggestions.
    pub fn resolve(&self, sampler: &mut (impl ParameterSampler + ?Sized)) -> TunerResult<TrialParams> {
        self.validate()?;

        let mut params = TrialParams::new();
        for def in &self.parameters {
            let value = match &def.kind {
                ParameterKind::Int(range) => {
                    ParameterValue::Int(sampler.suggest_int(&def.name, range)?)
                }
                ParameterKind::Float(range) => {
                    ParameterValue::Float(sampler.suggest_float(&def.name, range)?)
                }
                ParameterKind::Categorical { choices } => {
                    ParameterValue::Categorical(sampler.suggest_categorical(&def.name, choices)?)
                }
            };
            params.insert(def.name.clone(), value);
        }
        Ok(params)
    }
}
