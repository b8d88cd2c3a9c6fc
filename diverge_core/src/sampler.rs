use crate::config::ConfigError;
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Replaced in a flag's arguments by the value drawn for it.
pub const VALUE_PLACEHOLDER: &str = "{value}";

fn default_separator() -> String {
    ",".to_string()
}

/// One optional flag in a declarative flag table.
///
/// Each flag is drawn independently with `probability`, except that it is
/// skipped outright once any flag it is mutually exclusive with has already
/// been selected. Exclusion is symmetric: listing it on either side suffices.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FlagSpec {
    pub name: String,
    pub args: Vec<String>,
    pub probability: f64,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub value: Option<FlagValue>,
}

impl FlagSpec {
    pub fn switch(name: &str, args: &[&str], probability: f64) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            probability,
            excludes: Vec::new(),
            value: None,
        }
    }

    pub fn excluding(mut self, names: &[&str]) -> Self {
        self.excludes.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn with_value(mut self, value: FlagValue) -> Self {
        self.value = Some(value);
        self
    }

    fn instantiate<R: Rng + ?Sized>(&self, rng: &mut R) -> SelectedFlag {
        let value = self.value.as_ref().map(|v| v.draw(rng));
        let args = self
            .args
            .iter()
            .map(|arg| match &value {
                Some(v) => arg.replace(VALUE_PLACEHOLDER, v),
                None => arg.clone(),
            })
            .collect();
        SelectedFlag {
            name: self.name.clone(),
            args,
        }
    }
}

/// A parameter drawn for a flag each time it is selected.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum FlagValue {
    /// Uniform integer in `min..=max`.
    Int { min: i64, max: i64 },
    /// Items drawn with replacement from `choices`, one at a time, stopping
    /// after each item with `stop_probability`; joined by `separator`.
    Sequence {
        choices: Vec<String>,
        #[serde(rename = "stop-probability")]
        stop_probability: f64,
        #[serde(default = "default_separator")]
        separator: String,
    },
}

impl FlagValue {
    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        match self {
            FlagValue::Int { min, max } => rng.random_range(*min..=*max).to_string(),
            FlagValue::Sequence {
                choices,
                stop_probability,
                separator,
            } => {
                let mut picked: Vec<&str> = Vec::new();
                loop {
                    picked.push(&choices[rng.random_range(0..choices.len())]);
                    if rng.random_bool(*stop_probability) {
                        break;
                    }
                }
                picked.join(separator.as_str())
            }
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            FlagValue::Int { min, max } => min <= max,
            FlagValue::Sequence {
                choices,
                stop_probability,
                ..
            } => !choices.is_empty() && *stop_probability > 0.0 && *stop_probability <= 1.0,
        }
    }
}

/// A flag chosen for one iteration, with its drawn value already substituted.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SelectedFlag {
    pub name: String,
    pub args: Vec<String>,
}

/// A validated flag table and the generic sampler over it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagTable {
    specs: Vec<FlagSpec>,
}

impl FlagTable {
    pub fn new(specs: Vec<FlagSpec>) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateFlag(spec.name.clone()));
            }
            if !(0.0..=1.0).contains(&spec.probability) {
                return Err(ConfigError::InvalidProbability {
                    flag: spec.name.clone(),
                    probability: spec.probability,
                });
            }
            if let Some(value) = &spec.value {
                let has_placeholder = spec.args.iter().any(|a| a.contains(VALUE_PLACEHOLDER));
                if !value.is_valid() || !has_placeholder {
                    return Err(ConfigError::InvalidValue(spec.name.clone()));
                }
            }
        }
        for spec in &specs {
            for excluded in &spec.excludes {
                if excluded == &spec.name || !names.contains(excluded.as_str()) {
                    return Err(ConfigError::UnknownExclusion {
                        flag: spec.name.clone(),
                        excluded: excluded.clone(),
                    });
                }
            }
        }
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[FlagSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn are_exclusive(&self, a: &str, b: &str) -> bool {
        let lists = |from: &str, to: &str| {
            self.specs
                .iter()
                .any(|s| s.name == from && s.excludes.iter().any(|e| e == to))
        };
        lists(a, b) || lists(b, a)
    }

    /// Draws the flag subset for one iteration, in table order.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<SelectedFlag> {
        let mut selected: Vec<SelectedFlag> = Vec::new();
        for spec in &self.specs {
            if selected
                .iter()
                .any(|chosen| self.are_exclusive(&chosen.name, &spec.name))
            {
                continue;
            }
            if rng.random_bool(spec.probability) {
                selected.push(spec.instantiate(rng));
            }
        }
        selected
    }
}

/// Flattens selected flags into the argument list handed to a command.
pub fn flag_args(flags: &[SelectedFlag]) -> Vec<String> {
    flags.iter().flat_map(|f| f.args.iter().cloned()).collect()
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
    Os,
    Oz,
}

impl OptLevel {
    pub const ALL: [OptLevel; 6] = [
        OptLevel::O0,
        OptLevel::O1,
        OptLevel::O2,
        OptLevel::O3,
        OptLevel::Os,
        OptLevel::Oz,
    ];

    pub fn as_flag(self) -> &'static str {
        match self {
            OptLevel::O0 => "-O0",
            OptLevel::O1 => "-O1",
            OptLevel::O2 => "-O2",
            OptLevel::O3 => "-O3",
            OptLevel::Os => "-Os",
            OptLevel::Oz => "-Oz",
        }
    }

    pub fn is_size_optimized(self) -> bool {
        matches!(self, OptLevel::Os | OptLevel::Oz)
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OptLevelWeight {
    pub level: OptLevel,
    pub weight: u32,
}

/// Levels 0-3 share two thirds of the mass, `-Os`/`-Oz` the remaining third.
pub fn default_opt_level_weights() -> Vec<OptLevelWeight> {
    OptLevel::ALL
        .iter()
        .map(|&level| OptLevelWeight { level, weight: 1 })
        .collect()
}

#[derive(Debug, Clone)]
pub struct OptLevelTable {
    levels: Vec<OptLevel>,
    index: WeightedIndex<u32>,
}

impl OptLevelTable {
    pub fn new(weights: &[OptLevelWeight]) -> Result<Self, ConfigError> {
        let index = WeightedIndex::new(weights.iter().map(|w| w.weight))
            .map_err(|_| ConfigError::InvalidWeights)?;
        Ok(Self {
            levels: weights.iter().map(|w| w.level).collect(),
            index,
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> OptLevel {
        self.levels[self.index.sample(rng)]
    }
}
