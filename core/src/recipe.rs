use crate::crdt::Algorithm;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Declared type of one recipe field.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemType {
    String { regexp: Option<String> },
    Integer { min: Option<i64>, max: Option<i64> },
    Number { min: Option<f64>, max: Option<f64> },
    Boolean,
    /// `allowed` holds type names; `"*"` admits every type.
    ReferenceToObj { allowed: BTreeSet<String> },
    ReferenceToId { allowed: BTreeSet<String> },
    ReferenceToClob,
    ReferenceToBlob,
    Map { key: Box<ItemType>, value: Box<ItemType> },
    Bag { item: Box<ItemType> },
    Array { item: Box<ItemType> },
    Set { item: Box<ItemType> },
    Object { rules: Vec<RecipeRule> },
    Stringifiable,
}

impl ItemType {
    pub fn string() -> Self {
        Self::String { regexp: None }
    }

    pub fn integer() -> Self {
        Self::Integer {
            min: None,
            max: None,
        }
    }

    pub fn number() -> Self {
        Self::Number {
            min: None,
            max: None,
        }
    }

    pub fn reference_to_obj(allowed: impl IntoIterator<Item = &'static str>) -> Self {
        Self::ReferenceToObj {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn set_of(item: ItemType) -> Self {
        Self::Set {
            item: Box::new(item),
        }
    }

    pub fn array_of(item: ItemType) -> Self {
        Self::Array {
            item: Box::new(item),
        }
    }

    pub fn bag_of(item: ItemType) -> Self {
        Self::Bag {
            item: Box::new(item),
        }
    }

    pub fn map_of(key: ItemType, value: ItemType) -> Self {
        Self::Map {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String { .. } => "string",
            Self::Integer { .. } => "integer",
            Self::Number { .. } => "number",
            Self::Boolean => "boolean",
            Self::ReferenceToObj { .. } => "referenceToObj",
            Self::ReferenceToId { .. } => "referenceToId",
            Self::ReferenceToClob => "referenceToClob",
            Self::ReferenceToBlob => "referenceToBlob",
            Self::Map { .. } => "map",
            Self::Bag { .. } => "bag",
            Self::Array { .. } => "array",
            Self::Set { .. } => "set",
            Self::Object { .. } => "object",
            Self::Stringifiable => "stringifiable",
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Bag { .. } | Self::Array { .. } | Self::Set { .. })
    }

    fn may_key_map(&self) -> bool {
        !matches!(
            self,
            Self::Array { .. }
                | Self::Bag { .. }
                | Self::Map { .. }
                | Self::Object { .. }
                | Self::Set { .. }
                | Self::Stringifiable
        )
    }
}

/// What part of the target rule an [`Inherit`] extracts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Extract {
    CollectionItemType,
    MapItemType,
}

/// An `inheritFrom` declaration: a `Type.field[.field…]` path plus an
/// optional extraction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inherit {
    pub path: String,
    pub extract: Option<Extract>,
}

/// One field of a recipe.
#[derive(Clone, Debug, PartialEq)]
pub struct RecipeRule {
    pub itemprop: String,
    pub is_id: bool,
    pub optional: bool,
    pub itemtype: ItemType,
    pub inherit_from: Option<Inherit>,
}

impl RecipeRule {
    pub fn new(itemprop: impl Into<String>, itemtype: ItemType) -> Self {
        Self {
            itemprop: itemprop.into(),
            is_id: false,
            optional: false,
            itemtype,
            inherit_from: None,
        }
    }

    pub fn id(mut self) -> Self {
        self.is_id = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn inherit(mut self, path: impl Into<String>, extract: Option<Extract>) -> Self {
        self.inherit_from = Some(Inherit {
            path: path.into(),
            extract,
        });
        self
    }
}

/// The schema of one object type.
#[derive(Clone, Debug, PartialEq)]
pub struct Recipe {
    pub name: String,
    pub rules: Vec<RecipeRule>,
    /// Per-path CRDT algorithm overrides consulted by the merge coordinator.
    pub crdt_config: BTreeMap<String, Algorithm>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, rules: Vec<RecipeRule>) -> Self {
        Self {
            name: name.into(),
            rules,
            crdt_config: BTreeMap::new(),
        }
    }

    pub fn with_crdt(mut self, path: impl Into<String>, algorithm: Algorithm) -> Self {
        self.crdt_config.insert(path.into(), algorithm);
        self
    }

    pub fn rule(&self, itemprop: &str) -> Option<&RecipeRule> {
        self.rules.iter().find(|r| r.itemprop == itemprop)
    }

    /// Rules of the identity projection, in declaration order.
    pub fn id_rules(&self) -> impl Iterator<Item = &RecipeRule> {
        self.rules.iter().filter(|r| r.is_id)
    }

    pub fn is_versioned(&self) -> bool {
        self.rules.iter().any(|r| r.is_id)
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> Error {
    Error::RecipeInvalid {
        name: name.into(),
        reason: reason.into(),
    }
}

fn check_itemprop(name: &str, itemprop: &str) -> Result<()> {
    if itemprop.is_empty() {
        return Err(invalid(name, "empty itemprop"));
    }
    if itemprop
        .chars()
        .any(|c| c == '<' || c == '>' || c == '.' || c.is_whitespace())
    {
        return Err(invalid(name, format!("illegal itemprop {itemprop:?}")));
    }
    Ok(())
}

fn check_itemtype(name: &str, itemtype: &ItemType, nested: bool) -> Result<()> {
    match itemtype {
        ItemType::String { regexp } => {
            if let Some(re) = regexp {
                regex::Regex::new(re)
                    .map_err(|e| invalid(name, format!("bad regexp {re:?}: {e}")))?;
            }
        }
        ItemType::Integer { min, max } => {
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(invalid(name, "integer range is reversed"));
                }
            }
        }
        ItemType::Number { min, max } => {
            for bound in [min, max].into_iter().flatten() {
                if !bound.is_finite() {
                    return Err(invalid(name, "number bound is not finite"));
                }
            }
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(invalid(name, "number range is reversed"));
                }
            }
        }
        ItemType::ReferenceToObj { allowed } | ItemType::ReferenceToId { allowed } => {
            if allowed.is_empty() {
                return Err(invalid(name, "empty allowed-types set"));
            }
        }
        ItemType::Map { key, value } => {
            if !key.may_key_map() {
                return Err(invalid(name, format!("{} cannot key a map", key.kind())));
            }
            check_itemtype(name, key, true)?;
            check_itemtype(name, value, true)?;
        }
        ItemType::Bag { item } | ItemType::Array { item } | ItemType::Set { item } => {
            check_itemtype(name, item, true)?;
        }
        ItemType::Object { rules } => {
            if rules.is_empty() {
                return Err(invalid(name, "nested object without rules"));
            }
            check_rules(name, rules, true)?;
        }
        ItemType::Boolean
        | ItemType::ReferenceToClob
        | ItemType::ReferenceToBlob
        | ItemType::Stringifiable => {}
    }
    let _ = nested;
    Ok(())
}

fn check_rules(name: &str, rules: &[RecipeRule], nested: bool) -> Result<()> {
    let mut seen = BTreeSet::new();
    for rule in rules {
        check_itemprop(name, &rule.itemprop)?;
        if !seen.insert(rule.itemprop.as_str()) {
            return Err(invalid(name, format!("duplicate itemprop {}", rule.itemprop)));
        }
        if nested && rule.is_id {
            return Err(invalid(name, "isId on a nested rule"));
        }
        if let Some(inherit) = &rule.inherit_from {
            if inherit.path.split('.').count() < 2 {
                return Err(invalid(name, format!("inheritFrom path {:?}", inherit.path)));
            }
        }
        check_itemtype(name, &rule.itemtype, nested)?;
    }
    Ok(())
}

#[derive(Default)]
struct Inner {
    /// Recipes as registered.
    raw: BTreeMap<String, Arc<Recipe>>,
    /// Recipes with every `inheritFrom` materialized.
    resolved: BTreeMap<String, Arc<Recipe>>,
    versioned: BTreeSet<String>,
}

/// In-process recipe table. Populated at init; reads only afterwards.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a recipe, validating it and resolving rule inheritance
    /// eagerly. Inheritance targets must already be registered.
    pub fn register(&self, recipe: Recipe) -> Result<()> {
        check_rules(&recipe.name, &recipe.rules, false)?;
        if recipe.rules.is_empty() {
            return Err(invalid(&recipe.name, "recipe without rules"));
        }
        let mut inner = self.inner.write();
        if inner.raw.contains_key(&recipe.name) {
            return Err(Error::RecipeExists {
                name: recipe.name.clone(),
            });
        }
        let mut resolved = recipe.clone();
        let mut visiting = BTreeSet::new();
        for rule in &mut resolved.rules {
            *rule = resolve_in(&inner, &recipe, rule, &mut visiting)?;
        }
        if resolved.is_versioned() {
            inner.versioned.insert(recipe.name.clone());
        }
        inner
            .resolved
            .insert(recipe.name.clone(), Arc::new(resolved));
        inner.raw.insert(recipe.name.clone(), Arc::new(recipe));
        Ok(())
    }

    /// Returns the resolved recipe for a type.
    pub fn get(&self, name: &str) -> Result<Arc<Recipe>> {
        self.inner
            .read()
            .resolved
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RecipeUnknown { name: name.into() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().resolved.contains_key(name)
    }

    /// Returns true if the type declares at least one identity field.
    pub fn is_versioned(&self, name: &str) -> Result<bool> {
        let inner = self.inner.read();
        if !inner.resolved.contains_key(name) {
            return Err(Error::RecipeUnknown { name: name.into() });
        }
        Ok(inner.versioned.contains(name))
    }

    /// Returns the rule with its `inheritFrom` link (and any nested ones)
    /// materialized.
    pub fn resolve_rule(&self, recipe: &Recipe, rule: &RecipeRule) -> Result<RecipeRule> {
        let inner = self.inner.read();
        let mut visiting = BTreeSet::new();
        resolve_in(&inner, recipe, rule, &mut visiting)
    }
}

fn resolve_in(
    inner: &Inner,
    recipe: &Recipe,
    rule: &RecipeRule,
    visiting: &mut BTreeSet<String>,
) -> Result<RecipeRule> {
    let mut resolved = rule.clone();
    if let Some(inherit) = &rule.inherit_from {
        if !visiting.insert(inherit.path.clone()) {
            return Err(invalid(
                &recipe.name,
                format!("inheritance cycle through {}", inherit.path),
            ));
        }
        resolved.itemtype = inherited_itemtype(inner, recipe, inherit, visiting)?;
        resolved.inherit_from = None;
        visiting.remove(&inherit.path);
    }
    // depth-first through the itemtype subtree
    resolved.itemtype = resolve_itemtype(inner, recipe, resolved.itemtype, visiting)?;
    Ok(resolved)
}

fn resolve_itemtype(
    inner: &Inner,
    recipe: &Recipe,
    itemtype: ItemType,
    visiting: &mut BTreeSet<String>,
) -> Result<ItemType> {
    Ok(match itemtype {
        ItemType::Object { rules } => {
            let mut resolved = Vec::with_capacity(rules.len());
            for rule in &rules {
                resolved.push(resolve_in(inner, recipe, rule, visiting)?);
            }
            ItemType::Object { rules: resolved }
        }
        ItemType::Map { key, value } => ItemType::Map {
            key: Box::new(resolve_itemtype(inner, recipe, *key, visiting)?),
            value: Box::new(resolve_itemtype(inner, recipe, *value, visiting)?),
        },
        ItemType::Bag { item } => ItemType::Bag {
            item: Box::new(resolve_itemtype(inner, recipe, *item, visiting)?),
        },
        ItemType::Array { item } => ItemType::Array {
            item: Box::new(resolve_itemtype(inner, recipe, *item, visiting)?),
        },
        ItemType::Set { item } => ItemType::Set {
            item: Box::new(resolve_itemtype(inner, recipe, *item, visiting)?),
        },
        other => other,
    })
}

fn inherited_itemtype(
    inner: &Inner,
    recipe: &Recipe,
    inherit: &Inherit,
    visiting: &mut BTreeSet<String>,
) -> Result<ItemType> {
    let mut segments = inherit.path.split('.');
    let type_name = segments.next().unwrap_or_default();
    // a recipe may inherit from its own rules before registration completes
    let source: &Recipe = if type_name == recipe.name {
        recipe
    } else {
        inner
            .raw
            .get(type_name)
            .map(Arc::as_ref)
            .ok_or_else(|| Error::RecipeUnknown {
                name: type_name.into(),
            })?
    };
    let mut rule = None;
    let mut rules = &source.rules;
    for segment in segments {
        let found = rules
            .iter()
            .find(|r| r.itemprop == segment)
            .ok_or_else(|| {
                invalid(
                    &recipe.name,
                    format!("inheritFrom target {} not found", inherit.path),
                )
            })?;
        rule = Some(found);
        rules = match &found.itemtype {
            ItemType::Object { rules } => rules,
            _ => &NO_RULES,
        };
    }
    let rule = rule.ok_or_else(|| invalid(&recipe.name, "inheritFrom path too short"))?;
    let resolved = resolve_in(inner, source, rule, visiting)?;
    match inherit.extract {
        None => Ok(resolved.itemtype),
        Some(Extract::CollectionItemType) => match resolved.itemtype {
            ItemType::Bag { item } | ItemType::Array { item } | ItemType::Set { item } => {
                Ok(*item)
            }
            other => Err(invalid(
                &recipe.name,
                format!("CollectionItemType from a {}", other.kind()),
            )),
        },
        Some(Extract::MapItemType) => match resolved.itemtype {
            ItemType::Map { key, value } => Ok(ItemType::Object {
                rules: vec![
                    RecipeRule::new("key", *key),
                    RecipeRule::new("value", *value),
                ],
            }),
            other => Err(invalid(
                &recipe.name,
                format!("MapItemType from a {}", other.kind()),
            )),
        },
    }
}

static NO_RULES: Vec<RecipeRule> = Vec::new();
