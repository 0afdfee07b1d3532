//! Path-segment function library.
//!
//! Functions appear as call segments inside property paths
//! (`Breakers.Where(State,Equals,'open').Count()`) and are interpreted
//! directly over `serde_json::Value` graphs. Macros registered per asset
//! kind take precedence over built-ins so deployments can extend the path
//! vocabulary without touching the engine.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Number, Value};
use tracing::trace;

use crate::error::{Result, RuleError};
use crate::operators::{as_f64, Operator};
use crate::path::{unquote, IndexKey, PathResolver, Segment};

/// Sentinel appended by `Traverse` when the parent chain revisits an id.
pub const CYCLE_SENTINEL: &str = "!!";

/// Built-in path functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionName {
    // Aggregates: reduce a collection to a scalar or item.
    Count,
    DistinctCount,
    Average,
    Min,
    Max,
    Sum,
    First,
    Last,
    // Navigational: reshape a collection or produce a point-in-time value.
    Select,
    SelectMany,
    Where,
    OrderBy,
    OrderByDesc,
    Ago,
    Traverse,
}

impl FromStr for FunctionName {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "distinctcount" => Ok(Self::DistinctCount),
            "average" => Ok(Self::Average),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "sum" => Ok(Self::Sum),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "select" => Ok(Self::Select),
            "selectmany" => Ok(Self::SelectMany),
            "where" => Ok(Self::Where),
            "orderby" => Ok(Self::OrderBy),
            "orderbydesc" => Ok(Self::OrderByDesc),
            "ago" => Ok(Self::Ago),
            "traverse" => Ok(Self::Traverse),
            _ => Err(RuleError::UnresolvedSegment {
                path: String::new(),
                segment: s.to_string(),
            }),
        }
    }
}

impl FunctionName {
    /// Inclusive argument-count bounds.
    pub fn arg_bounds(self) -> (usize, usize) {
        match self {
            Self::Count
            | Self::DistinctCount
            | Self::Average
            | Self::Min
            | Self::Max
            | Self::Sum
            | Self::OrderBy
            | Self::OrderByDesc => (0, 1),
            Self::First | Self::Last => (0, 0),
            Self::Select | Self::SelectMany | Self::Ago => (1, 1),
            Self::Where => (3, 3),
            Self::Traverse => (2, 3),
        }
    }

    /// Validate an argument list against the bounds.
    pub fn check_args(self, args: &[String]) -> Result<()> {
        let (min, max) = self.arg_bounds();
        if args.len() < min || args.len() > max {
            return Err(RuleError::Format(format!(
                "{self:?} takes {min}..={max} arguments, got {}",
                args.len()
            )));
        }
        Ok(())
    }
}

/// Extension function evaluated against the current path value.
pub type MacroFn = Arc<dyn Fn(&Value, &[String]) -> Result<Value> + Send + Sync>;

/// Registry of extension functions keyed by asset kind and macro name.
///
/// Built once at startup and shared read-only across evaluations.
#[derive(Default, Clone)]
pub struct MacroRegistry {
    macros: HashMap<(String, String), MacroFn>,
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a macro for an asset kind. Names match case-insensitively.
    pub fn register(
        &mut self,
        asset_kind: impl Into<String>,
        name: impl Into<String>,
        func: MacroFn,
    ) {
        let key = (
            asset_kind.into().to_ascii_lowercase(),
            name.into().to_ascii_lowercase(),
        );
        self.macros.insert(key, func);
    }

    /// Look up a macro for a concrete asset kind.
    pub fn lookup(&self, asset_kind: &str, name: &str) -> Option<&MacroFn> {
        self.macros.get(&(
            asset_kind.to_ascii_lowercase(),
            name.to_ascii_lowercase(),
        ))
    }

    /// Whether any kind registers a macro under this name. Used at compile
    /// time, when the concrete asset kind is not yet known.
    pub fn knows_name(&self, name: &str) -> bool {
        let lowered = name.to_ascii_lowercase();
        self.macros.keys().any(|(_, n)| *n == lowered)
    }
}

/// Parse a duration token: an integer followed by `m`, `h`, or `d`.
pub fn parse_duration_token(token: &str) -> Result<Duration> {
    let token = token.trim();
    let (digits, unit) = token.split_at(token.len().saturating_sub(1));
    let amount: i64 = digits
        .parse()
        .map_err(|_| RuleError::Format(format!("invalid duration token '{token}'")))?;
    match unit {
        "m" => Ok(Duration::minutes(amount)),
        "h" => Ok(Duration::hours(amount)),
        "d" => Ok(Duration::days(amount)),
        _ => Err(RuleError::Format(format!(
            "invalid duration unit in '{token}', expected m|h|d"
        ))),
    }
}

/// Evaluate a parsed path program against a payload object graph.
///
/// Missing properties resolve to `Null` and propagate; the operator layer
/// turns that into a failed comparison rather than an error.
pub fn eval_path(
    segments: &[Segment],
    root: &Value,
    asset_kind: &str,
    registry: &MacroRegistry,
) -> Result<Value> {
    let mut current = root.clone();
    for segment in segments {
        current = eval_segment(segment, &current, asset_kind, registry)?;
    }
    Ok(current)
}

fn eval_segment(
    segment: &Segment,
    current: &Value,
    asset_kind: &str,
    registry: &MacroRegistry,
) -> Result<Value> {
    match segment {
        Segment::Property(name) => Ok(get_property(current, name)),
        Segment::Indexer { name, key } => {
            let container = get_property(current, name);
            Ok(match key {
                IndexKey::Str(k) => get_property(&container, k),
                IndexKey::Num(n) => container
                    .as_array()
                    .and_then(|arr| arr.get(*n))
                    .cloned()
                    .unwrap_or(Value::Null),
            })
        }
        Segment::Call { name, args } => {
            // Macro resolution wins over built-ins.
            if let Some(func) = registry.lookup(asset_kind, name) {
                trace!(macro_name = %name, asset_kind, "invoking macro");
                return func(current, args);
            }
            let function = FunctionName::from_str(name)?;
            function.check_args(args)?;
            eval_function(function, args, current, asset_kind, registry)
        }
    }
}

/// Case-insensitive property lookup; anything unresolvable is `Null`.
fn get_property(current: &Value, name: &str) -> Value {
    match current {
        Value::Object(map) => {
            if let Some(v) = map.get(name) {
                return v.clone();
            }
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn eval_function(
    function: FunctionName,
    args: &[String],
    current: &Value,
    asset_kind: &str,
    registry: &MacroRegistry,
) -> Result<Value> {
    match function {
        FunctionName::Ago => {
            let duration = parse_duration_token(&args[0])?;
            Ok(Value::String((Utc::now() - duration).to_rfc3339()))
        }
        FunctionName::Traverse => traverse(current, args),
        _ => eval_collection_function(function, args, current, asset_kind, registry),
    }
}

fn items_of<'a>(current: &'a Value, function: FunctionName) -> Result<&'a Vec<Value>> {
    current.as_array().ok_or_else(|| {
        RuleError::Eval(format!(
            "{function:?} expects a collection, found {}",
            match current {
                Value::Null => "null",
                Value::Bool(_) => "boolean",
                Value::Number(_) => "number",
                Value::String(_) => "string",
                Value::Object(_) => "object",
                Value::Array(_) => "array",
            }
        ))
    })
}

/// Project every element through a (possibly multi-segment) member path.
fn project_all(
    items: &[Value],
    member_path: &str,
    asset_kind: &str,
    registry: &MacroRegistry,
) -> Result<Vec<Value>> {
    let program = PathResolver::parse(member_path)?;
    items
        .iter()
        .map(|item| eval_path(&program, item, asset_kind, registry))
        .collect()
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Total order for sort keys: numbers before strings before the rest,
/// nulls first within a run.
fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a, b) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

/// Resolve a `Where` comparison value: quoted string, boolean, number, a
/// zero-argument function call such as `Ago(15m)`, or a bare string.
fn resolve_where_value(raw: &str, asset_kind: &str, registry: &MacroRegistry) -> Result<Value> {
    if let Some(s) = unquote(raw) {
        return Ok(Value::String(s.to_string()));
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Ok(number(n));
    }
    if raw.contains('(') && raw.ends_with(')') {
        let segment = PathResolver::classify(raw)?;
        return eval_segment(&segment, &Value::Null, asset_kind, registry);
    }
    Ok(Value::String(raw.to_string()))
}

/// Iterative parent-chain walk with cycle detection.
///
/// Emits the ordered list of visited ids starting at the current node. A
/// repeated id appends [`CYCLE_SENTINEL`] and stops the walk; a positive
/// `maxSteps` bounds the number of hops.
fn traverse(current: &Value, args: &[String]) -> Result<Value> {
    let parent_prop = &args[0];
    let id_prop = &args[1];
    let max_steps: i64 = match args.get(2) {
        Some(raw) => raw
            .parse()
            .map_err(|_| RuleError::Format(format!("invalid maxSteps '{raw}'")))?,
        None => 0,
    };

    let mut visited: HashSet<String> = HashSet::new();
    let mut ids: Vec<Value> = Vec::new();
    let mut node = current.clone();
    let mut hops: i64 = 0;

    loop {
        if node.is_null() {
            break;
        }
        let id = match get_property(&node, id_prop) {
            Value::Null => {
                return Err(RuleError::Eval(format!(
                    "traverse node has no '{id_prop}' id"
                )))
            }
            Value::String(s) => s,
            other => other.to_string(),
        };
        if !visited.insert(id.clone()) {
            ids.push(Value::String(CYCLE_SENTINEL.to_string()));
            break;
        }
        ids.push(Value::String(id));

        if max_steps > 0 && hops >= max_steps {
            break;
        }
        hops += 1;
        node = get_property(&node, parent_prop);
    }

    Ok(Value::Array(ids))
}

// Collection functions proper. Split out of `eval_function` so the match
// above stays readable.
pub(crate) fn eval_collection_function(
    function: FunctionName,
    args: &[String],
    current: &Value,
    asset_kind: &str,
    registry: &MacroRegistry,
) -> Result<Value> {
    match function {
        FunctionName::Count => {
            let items = items_of(current, function)?;
            if let Some(member) = args.first() {
                let projected = project_all(items, member, asset_kind, registry)?;
                Ok(Value::from(projected.iter().filter(|v| !v.is_null()).count()))
            } else {
                Ok(Value::from(items.len()))
            }
        }
        FunctionName::DistinctCount => {
            let items = items_of(current, function)?;
            let values = match args.first() {
                Some(member) => project_all(items, member, asset_kind, registry)?,
                None => items.clone(),
            };
            let distinct: HashSet<String> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(|v| v.to_string())
                .collect();
            Ok(Value::from(distinct.len()))
        }
        FunctionName::Sum | FunctionName::Average | FunctionName::Min | FunctionName::Max => {
            let items = items_of(current, function)?;
            let values = match args.first() {
                Some(member) => project_all(items, member, asset_kind, registry)?,
                None => items.clone(),
            };
            let mut nums = Vec::with_capacity(values.len());
            for v in &values {
                if v.is_null() {
                    continue;
                }
                nums.push(as_f64(v).ok_or_else(|| {
                    RuleError::Eval(format!("{function:?} expects numeric elements"))
                })?);
            }
            Ok(match function {
                FunctionName::Sum => number(nums.iter().sum()),
                FunctionName::Average if nums.is_empty() => Value::Null,
                FunctionName::Average => number(nums.iter().sum::<f64>() / nums.len() as f64),
                FunctionName::Min => nums
                    .iter()
                    .cloned()
                    .fold(None::<f64>, |acc, x| Some(acc.map_or(x, |a| a.min(x))))
                    .map(number)
                    .unwrap_or(Value::Null),
                FunctionName::Max => nums
                    .iter()
                    .cloned()
                    .fold(None::<f64>, |acc, x| Some(acc.map_or(x, |a| a.max(x))))
                    .map(number)
                    .unwrap_or(Value::Null),
                _ => unreachable!(),
            })
        }
        FunctionName::First => Ok(items_of(current, function)?
            .first()
            .cloned()
            .unwrap_or(Value::Null)),
        FunctionName::Last => Ok(items_of(current, function)?
            .last()
            .cloned()
            .unwrap_or(Value::Null)),
        FunctionName::Select => {
            let items = items_of(current, function)?;
            Ok(Value::Array(project_all(items, &args[0], asset_kind, registry)?))
        }
        FunctionName::SelectMany => {
            let items = items_of(current, function)?;
            let projected = project_all(items, &args[0], asset_kind, registry)?;
            let mut flat = Vec::new();
            for value in projected {
                match value {
                    Value::Array(inner) => flat.extend(inner),
                    Value::Null => {}
                    other => {
                        return Err(RuleError::Eval(format!(
                            "SelectMany projection produced non-collection {other}"
                        )))
                    }
                }
            }
            Ok(Value::Array(flat))
        }
        FunctionName::Where => {
            let items = items_of(current, function)?;
            let field_program = PathResolver::parse(&args[0])?;
            let operator: Operator = args[1].parse()?;
            if !operator.allowed_in_where() {
                return Err(RuleError::Format(format!(
                    "operator '{operator}' is not allowed inside Where"
                )));
            }
            // Resolved once, not per element.
            let needle = resolve_where_value(&args[2], asset_kind, registry)?;
            let mut kept = Vec::new();
            for item in items {
                let left = eval_path(&field_program, item, asset_kind, registry)?;
                if operator.apply(&left, &needle, &[])? {
                    kept.push(item.clone());
                }
            }
            Ok(Value::Array(kept))
        }
        FunctionName::OrderBy | FunctionName::OrderByDesc => {
            let mut items = items_of(current, function)?.clone();
            let key_program = match args.first() {
                Some(member) => Some(PathResolver::parse(member)?),
                None => None,
            };
            let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                let key = match &key_program {
                    Some(program) => eval_path(program, &item, asset_kind, registry)?,
                    None => item.clone(),
                };
                keyed.push((key, item));
            }
            keyed.sort_by(|(a, _), (b, _)| compare_values(a, b));
            if function == FunctionName::OrderByDesc {
                keyed.reverse();
            }
            Ok(Value::Array(keyed.into_iter().map(|(_, item)| item).collect()))
        }
        FunctionName::Ago | FunctionName::Traverse => unreachable!("handled by eval_function"),
    }
}
