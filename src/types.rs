use serde::{Deserialize, Deserializer, Serialize};

/// Material grade identifier; plans and orders are independent per grade.
pub type GradeId = i64;

/// Converts slit width-units times roll count into tonnes.
pub const AREAL_WEIGHT: f64 = 3.0 / 385.0;

/// Accepts JSON numbers written as floats (e.g. `10.0`) for integer fields.
pub fn deserialize_u32_from_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value < 0.0 || value > u32::MAX as f64 || value.fract() != 0.0 {
        return Err(serde::de::Error::custom(format!(
            "expected a non-negative integer, got {value}"
        )));
    }
    Ok(value as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub width: u32,
    #[serde(deserialize_with = "deserialize_u32_from_number")]
    pub quantity: u32,
}

impl std::fmt::Display for OrderLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.quantity)
    }
}

/// Outstanding orders for one grade: sorted ascending by width, one line
/// per width. An immutable snapshot taken at the start of an optimizer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderSet {
    lines: Vec<OrderLine>,
}

impl OrderSet {
    /// Sorts by width and merges duplicate widths by summing quantities.
    pub fn new(mut lines: Vec<OrderLine>) -> Self {
        lines.retain(|l| l.width > 0);
        lines.sort_by_key(|l| l.width);
        let mut merged: Vec<OrderLine> = Vec::with_capacity(lines.len());
        for line in lines {
            match merged.last_mut() {
                Some(last) if last.width == line.width => last.quantity += line.quantity,
                _ => merged.push(line),
            }
        }
        Self { lines: merged }
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn widths(&self) -> Vec<u32> {
        self.lines.iter().map(|l| l.width).collect()
    }

    pub fn quantities(&self) -> Vec<u32> {
        self.lines.iter().map(|l| l.quantity).collect()
    }
}

/// One accepted cut combining two or three widths into a full-width trim.
/// Self-pairings repeat the same width in both slots. Never recorded with
/// zero net quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimAction {
    pub width_a: u32,
    pub qty_a: u32,
    pub width_b: u32,
    pub qty_b: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_c: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty_c: Option<u32>,
}

impl TrimAction {
    pub fn pair(width_a: u32, qty_a: u32, width_b: u32, qty_b: u32) -> Self {
        Self {
            width_a,
            qty_a,
            width_b,
            qty_b,
            width_c: None,
            qty_c: None,
        }
    }

    pub fn triple(width_a: u32, width_b: u32, width_c: u32, qty: u32) -> Self {
        Self {
            width_a,
            qty_a: qty,
            width_b,
            qty_b: qty,
            width_c: Some(width_c),
            qty_c: Some(qty),
        }
    }

    /// Total rolls of `width` this action consumes, counting repeated slots.
    pub fn consumed_of(&self, width: u32) -> u32 {
        let mut total = 0;
        if self.width_a == width {
            total += self.qty_a;
        }
        if self.width_b == width {
            total += self.qty_b;
        }
        if self.width_c == Some(width) {
            total += self.qty_c.unwrap_or(0);
        }
        total
    }
}

/// Per-width counters after both trimming stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResidual {
    pub width: u32,
    pub original: u32,
    pub consumed_stage1: u32,
    pub residual_stage1: u32,
    pub consumed_stage2: u32,
    pub residual_stage2: u32,
}

/// The output of one completed optimizer run for one grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimPlan {
    pub residuals: Vec<StageResidual>,
    pub leftover_weight: f64,
    pub actions: Vec<TrimAction>,
    pub stage1_pair_count: f64,
}

impl TrimPlan {
    pub fn is_fully_trimmed(&self) -> bool {
        self.residuals.iter().all(|r| r.residual_stage2 == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_set_sorts_and_merges() {
        let set = OrderSet::new(vec![
            OrderLine { width: 162, quantity: 4 },
            OrderLine { width: 150, quantity: 10 },
            OrderLine { width: 162, quantity: 6 },
        ]);
        assert_eq!(set.widths(), vec![150, 162]);
        assert_eq!(set.quantities(), vec![10, 10]);
    }

    #[test]
    fn test_order_set_drops_zero_widths() {
        let set = OrderSet::new(vec![
            OrderLine { width: 0, quantity: 5 },
            OrderLine { width: 150, quantity: 1 },
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.lines()[0].width, 150);
    }

    #[test]
    fn test_action_consumed_counts_repeated_slots() {
        let self_pair = TrimAction::pair(156, 3, 156, 3);
        assert_eq!(self_pair.consumed_of(156), 6);

        let triple = TrimAction::triple(100, 100, 112, 4);
        assert_eq!(triple.consumed_of(100), 8);
        assert_eq!(triple.consumed_of(112), 4);
        assert_eq!(triple.consumed_of(150), 0);
    }

    #[test]
    fn test_lenient_quantity_deserialization() {
        let line: OrderLine = serde_json::from_str(r#"{"width":150,"quantity":10.0}"#).unwrap();
        assert_eq!(line.quantity, 10);
        assert!(serde_json::from_str::<OrderLine>(r#"{"width":150,"quantity":10.5}"#).is_err());
        assert!(serde_json::from_str::<OrderLine>(r#"{"width":150,"quantity":-1}"#).is_err());
    }

    #[test]
    fn test_plan_round_trips_through_json() {
        let plan = TrimPlan {
            residuals: vec![StageResidual {
                width: 150,
                original: 10,
                consumed_stage1: 8,
                residual_stage1: 2,
                consumed_stage2: 2,
                residual_stage2: 0,
            }],
            leftover_weight: 0.0,
            actions: vec![TrimAction::pair(150, 4, 162, 4)],
            stage1_pair_count: 4.0,
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: TrimPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert!(back.is_fully_trimmed());
    }
}
