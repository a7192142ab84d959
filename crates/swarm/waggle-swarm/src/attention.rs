//! Attention glue: combine per-agent outputs into one consensus output
//!
//! The coordinator only relies on two properties here: the participating
//! agents are a subset of the inputs, and the primary contributor carries
//! the maximum weight. The mechanisms differ purely in how they turn
//! per-agent confidence into a weight distribution summing to 1.

use serde::{Deserialize, Serialize};
use waggle_core::AgentId;

/// Selectable weighting mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttentionMechanism {
    #[default]
    Flash,
    MultiHead,
    Linear,
    Hyperbolic,
    Moe,
    GraphRope,
}

/// One agent's contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: AgentId,
    pub content: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
    pub confidence: Option<f64>,
}

/// Combined output with its attention distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionResult {
    pub consensus_output: serde_json::Value,
    /// Per-agent weights; they sum to 1.
    pub weights: Vec<(AgentId, f64)>,
    /// Agent holding the maximum weight.
    pub primary: AgentId,
    pub participating_agents: Vec<AgentId>,
}

const DEFAULT_CONFIDENCE: f64 = 0.5;
const MOE_TOP_K: usize = 2;

/// Combine agent outputs under the chosen mechanism. Returns `None` for an
/// empty input.
pub fn combine(outputs: &[AgentOutput], mechanism: AttentionMechanism) -> Option<AttentionResult> {
    if outputs.is_empty() {
        return None;
    }
    let confidences: Vec<f64> = outputs
        .iter()
        .map(|o| o.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0))
        .collect();

    let raw = match mechanism {
        AttentionMechanism::Flash => softmax(&confidences, 4.0),
        AttentionMechanism::MultiHead => multi_head(&confidences),
        AttentionMechanism::Linear => confidences.clone(),
        AttentionMechanism::Hyperbolic => confidences.iter().map(|c| c.tanh()).collect(),
        AttentionMechanism::Moe => top_k_gate(&confidences, MOE_TOP_K),
        AttentionMechanism::GraphRope => confidences
            .iter()
            .enumerate()
            .map(|(i, c)| c / (1.0 + (1.0 + i as f64).ln()))
            .collect(),
    };
    let weights = normalize(&raw);

    let primary_index = weights
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)?;

    let participating: Vec<AgentId> = outputs
        .iter()
        .zip(&weights)
        .filter(|(_, w)| **w > 0.0)
        .map(|(o, _)| o.agent_id.clone())
        .collect();

    Some(AttentionResult {
        consensus_output: outputs[primary_index].content.clone(),
        weights: outputs
            .iter()
            .zip(&weights)
            .map(|(o, w)| (o.agent_id.clone(), *w))
            .collect(),
        primary: outputs[primary_index].agent_id.clone(),
        participating_agents: participating,
    })
}

/// Numerically stable softmax with a sharpness scale.
fn softmax(values: &[f64], scale: f64) -> Vec<f64> {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| ((v - max) * scale).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Average of several softmax heads at different temperatures.
fn multi_head(values: &[f64]) -> Vec<f64> {
    const SCALES: [f64; 4] = [1.0, 2.0, 4.0, 8.0];
    let mut combined = vec![0.0; values.len()];
    for scale in SCALES {
        for (slot, weight) in combined.iter_mut().zip(softmax(values, scale)) {
            *slot += weight / SCALES.len() as f64;
        }
    }
    combined
}

/// Keep the top-k values, zero the rest.
fn top_k_gate(values: &[f64], k: usize) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let kept: Vec<usize> = order.into_iter().take(k.max(1)).collect();
    values
        .iter()
        .enumerate()
        .map(|(i, v)| if kept.contains(&i) { *v } else { 0.0 })
        .collect()
}

fn normalize(values: &[f64]) -> Vec<f64> {
    let sum: f64 = values.iter().sum();
    if sum <= 0.0 {
        // Degenerate case: fall back to a uniform distribution.
        return vec![1.0 / values.len() as f64; values.len()];
    }
    values.iter().map(|v| v / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use waggle_core::{AgentKind, IdAllocator};

    fn outputs(confidences: &[f64]) -> Vec<AgentOutput> {
        let alloc = IdAllocator::new(Uuid::new_v4());
        confidences
            .iter()
            .enumerate()
            .map(|(i, c)| AgentOutput {
                agent_id: alloc.agent_id(AgentKind::Worker),
                content: serde_json::json!(format!("answer-{i}")),
                embedding: None,
                confidence: Some(*c),
            })
            .collect()
    }

    #[test]
    fn weights_sum_to_one_for_every_mechanism() {
        let inputs = outputs(&[0.9, 0.5, 0.3, 0.7]);
        for mechanism in [
            AttentionMechanism::Flash,
            AttentionMechanism::MultiHead,
            AttentionMechanism::Linear,
            AttentionMechanism::Hyperbolic,
            AttentionMechanism::Moe,
            AttentionMechanism::GraphRope,
        ] {
            let result = combine(&inputs, mechanism).unwrap();
            let sum: f64 = result.weights.iter().map(|(_, w)| w).sum();
            assert!((sum - 1.0).abs() < 1e-9, "{mechanism:?} summed to {sum}");
        }
    }

    #[test]
    fn primary_holds_the_maximum_weight() {
        let inputs = outputs(&[0.2, 0.95, 0.4]);
        let result = combine(&inputs, AttentionMechanism::Flash).unwrap();
        assert_eq!(result.primary, inputs[1].agent_id);
        assert_eq!(result.consensus_output, serde_json::json!("answer-1"));
        let max = result
            .weights
            .iter()
            .map(|(_, w)| *w)
            .fold(f64::NEG_INFINITY, f64::max);
        let primary_weight = result
            .weights
            .iter()
            .find(|(id, _)| *id == result.primary)
            .unwrap()
            .1;
        assert_eq!(primary_weight, max);
    }

    #[test]
    fn moe_keeps_only_top_k_participants() {
        let inputs = outputs(&[0.9, 0.8, 0.1, 0.05]);
        let result = combine(&inputs, AttentionMechanism::Moe).unwrap();
        assert_eq!(result.participating_agents.len(), 2);
        assert!(result.participating_agents.contains(&inputs[0].agent_id));
        assert!(result.participating_agents.contains(&inputs[1].agent_id));
    }

    #[test]
    fn participants_are_a_subset_of_inputs() {
        let inputs = outputs(&[0.6, 0.6, 0.6]);
        for mechanism in [AttentionMechanism::Linear, AttentionMechanism::GraphRope] {
            let result = combine(&inputs, mechanism).unwrap();
            for id in &result.participating_agents {
                assert!(inputs.iter().any(|o| o.agent_id == *id));
            }
        }
    }

    #[test]
    fn empty_input_yields_none() {
        assert!(combine(&[], AttentionMechanism::Flash).is_none());
    }
}
