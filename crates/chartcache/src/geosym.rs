//! Symbology assignment rules: which symbol set and labels a feature gets.
//!
//! Rule files are parsed elsewhere; assignments arrive here already
//! structured. This module owns the matching predicate: fcode, delineation,
//! coverage, and an optional attribute expression evaluated against feature
//! attributes plus caller-supplied external attributes (display settings
//! like safe-depth contours).

use std::collections::BTreeMap;

use flatchart::{AttrValue, FeatureAttrs};

/// External attribute names are exactly four characters and are neither
/// quoted strings nor numbers.
pub type ExternalAttrs = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    pub fn parse(op: &str) -> Option<CompareOp> {
        match op {
            "=" => Some(CompareOp::Eq),
            "<>" => Some(CompareOp::Ne),
            "<" => Some(CompareOp::Lt),
            ">" => Some(CompareOp::Gt),
            "<=" => Some(CompareOp::Le),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }

    fn eval_ord<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Ge => lhs >= rhs,
        }
    }
}

/// One comparison from a rule's attribute expression. The right-hand side
/// stays as written in the rule: a number, a quoted string, `NULL`, or the
/// name of an external attribute.
#[derive(Debug, Clone)]
pub struct GeosymComparison {
    pub lhs_attr: String,
    pub op: CompareOp,
    pub rhs: String,
}

#[derive(Debug, Clone)]
pub enum GeosymExpr {
    Comparison(GeosymComparison),
    All(Vec<GeosymExpr>),
    Any(Vec<GeosymExpr>),
}

impl GeosymExpr {
    pub fn eval(&self, feature_attrs: &FeatureAttrs, external_attrs: &ExternalAttrs) -> bool {
        match self {
            GeosymExpr::Comparison(c) => c.eval(feature_attrs, external_attrs),
            GeosymExpr::All(terms) => terms.iter().all(|t| t.eval(feature_attrs, external_attrs)),
            GeosymExpr::Any(terms) => terms.iter().any(|t| t.eval(feature_attrs, external_attrs)),
        }
    }
}

fn is_no_value_unparsed(s: &str) -> bool {
    s == "NULL" || s.is_empty()
}

fn is_quoted_string(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('"') && s.ends_with('"')
}

fn is_number(s: &str) -> bool {
    let t = s.trim();
    t.parse::<f64>().is_ok() || matches!(t, "Infinity" | "+Infinity" | "-Infinity")
}

pub fn is_external_attr(s: &str) -> bool {
    !is_no_value_unparsed(s) && !is_number(s) && !is_quoted_string(s) && s.len() == 4
}

/// Values that mean "not recorded" in the source data.
fn is_no_value(v: &AttrValue) -> bool {
    match v {
        AttrValue::Int(i) => *i == i32::MIN,
        AttrValue::Double(d) => d.is_nan(),
        AttrValue::Text(s) => s.is_empty(),
    }
}

impl GeosymComparison {
    pub fn eval(&self, feature_attrs: &FeatureAttrs, external_attrs: &ExternalAttrs) -> bool {
        let lhs = if is_external_attr(&self.lhs_attr) {
            external_attrs.get(&self.lhs_attr)
        } else {
            feature_attrs.get(&self.lhs_attr)
        };
        let lhs = lhs.filter(|v| !is_no_value(v));

        match lhs {
            None => match self.op {
                CompareOp::Eq => self.rhs_is_null(external_attrs),
                CompareOp::Ne => !self.rhs_is_null(external_attrs),
                _ => false,
            },
            Some(AttrValue::Text(lhs)) => {
                let rhs = self.rhs_as_text(external_attrs);
                match self.op {
                    CompareOp::Eq => rhs.as_deref() == Some(lhs.as_str()),
                    CompareOp::Ne => rhs.as_deref() != Some(lhs.as_str()),
                    // The rule grammar has no ordered string comparisons
                    _ => false,
                }
            }
            Some(AttrValue::Double(lhs)) => match self.rhs_as_double(external_attrs) {
                Some(rhs) => self.op.eval_ord(*lhs, rhs),
                None => self.op == CompareOp::Ne,
            },
            Some(AttrValue::Int(lhs)) => match self.rhs_as_int(external_attrs) {
                Some(rhs) => self.op.eval_ord(*lhs, rhs),
                None => self.op == CompareOp::Ne,
            },
        }
    }

    fn rhs_is_null(&self, external_attrs: &ExternalAttrs) -> bool {
        let s = self.rhs.as_str();
        if is_no_value_unparsed(s) {
            true
        } else if is_external_attr(s) {
            external_attrs.get(s).map_or(true, is_no_value)
        } else if is_number(s) {
            s.parse::<f64>().map(f64::is_nan).unwrap_or(false)
                || s.parse::<i32>().map(|v| v == i32::MIN).unwrap_or(false)
        } else if is_quoted_string(s) {
            s.len() == 2
        } else {
            false
        }
    }

    fn rhs_as_text(&self, external_attrs: &ExternalAttrs) -> Option<String> {
        let s = self.rhs.as_str();
        if is_no_value_unparsed(s) {
            None
        } else if is_external_attr(s) {
            match external_attrs.get(s) {
                Some(AttrValue::Text(v)) if !v.is_empty() => Some(v.clone()),
                _ => None,
            }
        } else if is_quoted_string(s) {
            let v = &s[1..s.len() - 1];
            if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            }
        } else {
            None
        }
    }

    fn rhs_as_double(&self, external_attrs: &ExternalAttrs) -> Option<f64> {
        let s = self.rhs.as_str();
        if is_no_value_unparsed(s) {
            None
        } else if is_external_attr(s) {
            match external_attrs.get(s) {
                Some(AttrValue::Double(v)) if !v.is_nan() => Some(*v),
                Some(AttrValue::Int(v)) if *v != i32::MIN => Some(f64::from(*v)),
                _ => None,
            }
        } else {
            s.parse::<f64>().ok().filter(|v| !v.is_nan())
        }
    }

    fn rhs_as_int(&self, external_attrs: &ExternalAttrs) -> Option<i32> {
        let s = self.rhs.as_str();
        if is_no_value_unparsed(s) {
            None
        } else if is_external_attr(s) {
            match external_attrs.get(s) {
                Some(AttrValue::Int(v)) if *v != i32::MIN => Some(*v),
                Some(AttrValue::Double(v)) if !v.is_nan() => Some(*v as i32),
                _ => None,
            }
        } else {
            s.parse::<i32>().ok().filter(|v| *v != i32::MIN)
        }
    }
}

/// One entry of a label template, naming the feature attribute whose value
/// it renders.
#[derive(Debug, Clone)]
pub struct LabelEntry {
    pub attr: String,
}

impl LabelEntry {
    /// Text for this entry, or `None` when the feature has no usable value
    /// for the entry's attribute. Valueless entries still occupy a slot in
    /// the label-lengths stream, recorded as length zero.
    pub fn text(&self, feature_attrs: &FeatureAttrs) -> Option<String> {
        let v = feature_attrs.get(&self.attr).filter(|v| !is_no_value(v))?;
        Some(match v {
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Double(d) => {
                if d.fract() == 0.0 && d.abs() < 1e15 {
                    format!("{}", *d as i64)
                } else {
                    d.to_string()
                }
            }
            AttrValue::Text(s) => s.clone(),
        })
    }
}

/// One label template. A feature may carry several, each yielding a run of
/// per-entry lengths plus a single anchor coordinate when any entry has text.
#[derive(Debug, Clone, Default)]
pub struct LabelMaker {
    pub entries: Vec<LabelEntry>,
}

#[derive(Debug, Clone)]
pub struct GeosymAssignment {
    pub id: i32,
    pub fcode: String,
    /// "Point", "Line", or "Area"; empty matches every delineation.
    pub delineation: String,
    /// Semicolon-separated coverage names the rule applies to; empty matches
    /// every coverage.
    pub coverage_type: String,
    pub attr_expr: Option<GeosymExpr>,
    pub point_symbol: String,
    pub line_symbol: String,
    pub area_symbol: String,
    pub display_priority: i32,
    pub orientation_attr: String,
    pub label_makers: Vec<LabelMaker>,
}

impl GeosymAssignment {
    pub fn matches(
        &self,
        fcode: &str,
        delineation: &str,
        coverage_name: &str,
        feature_attrs: &FeatureAttrs,
        external_attrs: &ExternalAttrs,
    ) -> bool {
        if self.fcode != fcode {
            return false;
        }
        if !self.delineation.is_empty() && self.delineation != delineation {
            return false;
        }
        if !self.coverage_type.is_empty()
            && !self.coverage_type.split(';').any(|c| c.trim() == coverage_name)
        {
            return false;
        }
        match &self.attr_expr {
            Some(expr) => expr.eval(feature_attrs, external_attrs),
            None => true,
        }
    }

    pub fn has_point_symbol(&self) -> bool {
        !self.point_symbol.is_empty()
    }

    pub fn has_line_symbol(&self) -> bool {
        !self.line_symbol.is_empty()
    }

    pub fn has_area_symbol(&self) -> bool {
        !self.area_symbol.is_empty()
    }
}

/// External attributes a chart display usually supplies, with their
/// conventional defaults: shallow/deep display modes and the three depth
/// contours (meters).
pub fn default_external_attrs() -> ExternalAttrs {
    let mut attrs = ExternalAttrs::new();
    attrs.insert("isdm".to_string(), AttrValue::Int(0));
    attrs.insert("idsm".to_string(), AttrValue::Int(1));
    attrs.insert("ssdc".to_string(), AttrValue::Int(18));
    attrs.insert("msdc".to_string(), AttrValue::Int(30));
    attrs.insert("mssc".to_string(), AttrValue::Int(2));
    attrs
}

/// Text form of the external attributes, folded into the render cache's
/// config string so caches with different display settings never mix.
pub fn external_attrs_config_lines(attrs: &ExternalAttrs) -> String {
    let mut lines = String::new();
    for (name, value) in attrs {
        let (text, kind) = match value {
            AttrValue::Int(v) => (v.to_string(), "integer"),
            AttrValue::Double(v) => (v.to_string(), "double"),
            AttrValue::Text(v) => (v.clone(), "string"),
        };
        lines.push_str(&format!("{} = {} ({})\n", name, text, kind));
    }
    lines
}
