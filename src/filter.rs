//! Filter and modifier catalogs (JSON tables extracted from the
//! sandbox runtime) and the resolver that turns raw
//! `(filter_id, argument_id)` pairs into printable SBPL arguments.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek};

use crate::op_node::{Decision, TerminalNode};
use crate::pattern;
use crate::sb_reader::SbSeek;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ArgumentType {
    #[serde(rename = "SB_VALUE_TYPE_BOOL", alias = "BOOL")]
    Bool,
    #[serde(rename = "SB_VALUE_TYPE_BITFIELD", alias = "BITFIELD")]
    Bitfield,
    #[serde(rename = "SB_VALUE_TYPE_INTEGER", alias = "INTEGER")]
    Integer,
    #[serde(rename = "SB_VALUE_TYPE_STRING", alias = "STRING")]
    String,
    #[serde(
        rename = "SB_VALUE_TYPE_PATTERN_LITERAL",
        alias = "PATTERN_LITERAL"
    )]
    PatternLiteral,
    #[serde(
        rename = "SB_VALUE_TYPE_PATTERN_PREFIX",
        alias = "PATTERN_PREFIX"
    )]
    PatternPrefix,
    #[serde(
        rename = "SB_VALUE_TYPE_PATTERN_SUBPATH",
        alias = "PATTERN_SUBPATH"
    )]
    PatternSubpath,
    #[serde(
        rename = "SB_VALUE_TYPE_PATTERN_REGEX",
        alias = "PATTERN_REGEX"
    )]
    PatternRegex,
    #[serde(rename = "SB_VALUE_TYPE_REGEX", alias = "REGEX")]
    Regex,
    #[serde(rename = "SB_VALUE_TYPE_NETWORK", alias = "NETWORK")]
    Network,
    #[serde(rename = "SB_VALUE_TYPE_BITMASK", alias = "BITMASK")]
    Bitmask,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    pub argument_type: ArgumentType,
    /// Symbolic names for integer arguments, keyed by decimal value.
    #[serde(default)]
    pub modifiers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterCatalog {
    by_id: BTreeMap<u8, FilterSpec>,
}

impl FilterCatalog {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: HashMap<String, FilterSpec> = serde_json::from_str(json)
            .context("filter catalog is not valid JSON")?;
        let mut by_id = BTreeMap::new();
        for (key, spec) in raw {
            let id: u8 = key
                .parse()
                .with_context(|| format!("non-numeric filter id {key:?}"))?;
            by_id.insert(id, spec);
        }
        Ok(Self { by_id })
    }

    pub fn get(&self, id: u8) -> Option<&FilterSpec> {
        self.by_id.get(&id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModifierSpec {
    pub name: String,
    pub action_mask: u32,
    pub action_flag: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ModifierCatalog {
    by_id: BTreeMap<u8, ModifierSpec>,
}

impl ModifierCatalog {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: HashMap<String, ModifierSpec> = serde_json::from_str(json)
            .context("modifier catalog is not valid JSON")?;
        let mut by_id = BTreeMap::new();
        for (key, spec) in raw {
            let id: u8 = key
                .parse()
                .with_context(|| format!("non-numeric modifier id {key:?}"))?;
            by_id.insert(id, spec);
        }
        Ok(Self { by_id })
    }

    pub fn get(&self, id: u8) -> Option<&ModifierSpec> {
        self.by_id.get(&id)
    }

    /// Modifiers selected by a terminal's flag word.
    pub fn applicable(&self, flags: u32) -> impl Iterator<Item = &ModifierSpec> {
        self.by_id.values().filter(move |spec| {
            spec.action_mask != 0
                && (flags & spec.action_mask) == spec.action_flag
        })
    }
}

/// Printable argument attached to a non-terminal, already shaped for
/// the SBPL printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterArgument {
    /// `#t` / `#f`
    Boolean(bool),
    /// Bare token: symbolic integer, decimal fallback, placeholder.
    Symbol(String),
    /// Double-quoted string.
    Literal(String),
    /// Set of accepted path patterns, each double-quoted.
    Patterns(Vec<String>),
    /// `#"..."` regex form.
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFilter {
    pub name: String,
    pub argument: FilterArgument,
}

/// Rendered decision attached to a terminal: the action head plus any
/// `(with ...)` parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalDecision {
    pub decision: Decision,
    pub modifiers: Vec<String>,
    /// Operation aliased by an inline action with `arg_id != 0`.
    pub alias_operation: Option<String>,
}

/// Memoizing resolver for non-terminal arguments. Failures localized
/// to one argument degrade into placeholders plus a warning; only the
/// container-level decode can fail hard.
pub struct FilterResolver<'a, R> {
    input: &'a mut R,
    file_len: u64,
    base_addr: u64,
    regex_list: &'a [String],
    global_vars: &'a [String],
    catalog: &'a FilterCatalog,
    cache: HashMap<(u8, u16), ResolvedFilter>,
}

impl<'a, R: Read + Seek> FilterResolver<'a, R> {
    pub fn new(
        input: &'a mut R,
        file_len: u64,
        base_addr: u64,
        regex_list: &'a [String],
        global_vars: &'a [String],
        catalog: &'a FilterCatalog,
    ) -> Self {
        Self {
            input,
            file_len,
            base_addr,
            regex_list,
            global_vars,
            catalog,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, filter_id: u8, argument_id: u16) -> ResolvedFilter {
        if let Some(hit) = self.cache.get(&(filter_id, argument_id)) {
            return hit.clone();
        }
        let resolved = self.resolve_uncached(filter_id, argument_id);
        self.cache
            .insert((filter_id, argument_id), resolved.clone());
        resolved
    }

    fn resolve_uncached(
        &mut self,
        filter_id: u8,
        argument_id: u16,
    ) -> ResolvedFilter {
        let Some(spec) = self.catalog.get(filter_id) else {
            warn!(filter_id, argument_id, "filter id missing from catalog");
            return ResolvedFilter {
                name: format!("unknown-filter-{filter_id}"),
                argument: FilterArgument::Symbol(argument_id.to_string()),
            };
        };
        let argument = match spec.argument_type {
            ArgumentType::Bool => FilterArgument::Boolean(argument_id == 1),
            ArgumentType::Integer => FilterArgument::Symbol(
                spec.modifiers
                    .get(&argument_id.to_string())
                    .cloned()
                    .unwrap_or_else(|| argument_id.to_string()),
            ),
            ArgumentType::String => match self.input.read_indirect_c_string(
                self.base_addr,
                argument_id,
                self.file_len,
            ) {
                Ok(text) => FilterArgument::Literal(text),
                Err(err) => {
                    warn!(
                        filter = %spec.name,
                        argument_id,
                        error = %err,
                        "string argument did not decode",
                    );
                    FilterArgument::Symbol(format!(
                        "unknown-string-{argument_id}"
                    ))
                }
            },
            ArgumentType::PatternLiteral
            | ArgumentType::PatternPrefix
            | ArgumentType::PatternSubpath => match self
                .read_pattern(argument_id)
            {
                Ok(patterns) => FilterArgument::Patterns(patterns),
                Err(err) => {
                    warn!(
                        filter = %spec.name,
                        argument_id,
                        error = %err,
                        "pattern bytecode did not decode",
                    );
                    FilterArgument::Symbol(format!(
                        "unknown-pattern-{argument_id}"
                    ))
                }
            },
            ArgumentType::PatternRegex => {
                match self.regex_list.get(usize::from(argument_id)) {
                    Some(regex) => FilterArgument::Regex(regex.clone()),
                    None => {
                        warn!(
                            filter = %spec.name,
                            argument_id,
                            "regex argument out of table bounds",
                        );
                        FilterArgument::Symbol(format!(
                            "unknown-regex-{argument_id}"
                        ))
                    }
                }
            }
            ArgumentType::Bitfield => {
                FilterArgument::Symbol(argument_id.to_string())
            }
            ArgumentType::Regex
            | ArgumentType::Network
            | ArgumentType::Bitmask => {
                warn!(
                    filter = %spec.name,
                    argument_id,
                    "argument kind is not supported yet",
                );
                FilterArgument::Symbol(format!(
                    "unsupported-argument-{argument_id}"
                ))
            }
        };
        ResolvedFilter {
            name: spec.name.clone(),
            argument,
        }
    }

    fn read_pattern(&mut self, argument_id: u16) -> Result<Vec<String>> {
        let blob = self.input.read_indirect_record(
            self.base_addr,
            argument_id,
            self.file_len,
        )?;
        pattern::decode_pattern(&blob, self.global_vars)
    }
}

/// Render the decision carried by a terminal: flag-selected modifiers
/// plus the optional inline action.
pub fn resolve_terminal<R: Read + Seek>(
    input: &mut R,
    file_len: u64,
    base_addr: u64,
    modifiers: &ModifierCatalog,
    sb_ops: &[String],
    policies: &[u16],
    node_count: usize,
    terminal: &TerminalNode,
) -> TerminalDecision {
    let mut rendered = Vec::new();
    let mut alias_operation = None;

    if let Some(inline) = terminal.inline {
        if inline.arg_id == 0 {
            let value = input
                .read_indirect_c_string(base_addr, inline.arg_value, file_len)
                .unwrap_or_else(|err| {
                    warn!(
                        node = terminal.offset,
                        error = %err,
                        "inline modifier argument did not decode",
                    );
                    format!("unknown-argument-{}", inline.arg_value)
                });
            match modifiers.get(inline.arg_type) {
                Some(spec) => {
                    rendered.push(format!("(with {} \"{value}\")", spec.name));
                }
                None => {
                    warn!(
                        node = terminal.offset,
                        modifier_id = inline.arg_type,
                        "inline modifier missing from catalog",
                    );
                    rendered.push(format!(
                        "(with unknown-modifier-{} \"{value}\")",
                        inline.arg_type,
                    ));
                }
            }
        } else {
            // the inline action points at another operation's subtree
            match sb_ops.get(usize::from(inline.arg_id)) {
                Some(operation) => alias_operation = Some(operation.clone()),
                None => warn!(
                    node = terminal.offset,
                    operation_index = inline.arg_id,
                    "inline action references an unnamed operation",
                ),
            }
            match policies.get(usize::from(inline.arg_value)) {
                Some(&root) if usize::from(root) < node_count => {}
                Some(&root) => warn!(
                    node = terminal.offset,
                    root,
                    "inline policy root is outside the node table",
                ),
                None => warn!(
                    node = terminal.offset,
                    policy_index = inline.arg_value,
                    "inline action references a missing policy entry",
                ),
            }
        }
    }

    for spec in modifiers.applicable(terminal.modifier_flags) {
        rendered.push(format!("(with {})", spec.name));
    }

    TerminalDecision {
        decision: terminal.decision(),
        modifiers: rendered,
        alias_operation,
    }
}
