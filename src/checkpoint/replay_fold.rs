//! 追加日志回放折叠：按顺序把审计事件归并成可导入的最新状态

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::checkpoint::model::{
    AuditEvent, AuditKind, EngineState, EquityPoint, LearnerMeta, LearnerState, PositionState,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayFold {
    pub run_id: Option<String>,
    pub positions: BTreeMap<String, PositionState>,
    pub equity_curve: Vec<EquityPoint>,
    pub allocator: Option<Value>,
    pub learner: Option<LearnerMeta>,
    pub queue: Option<Value>,
    pub events: usize,
}

impl ReplayFold {
    pub fn from_events(events: impl IntoIterator<Item = AuditEvent>) -> Self {
        let mut fold = Self::default();
        for event in events {
            fold.apply(event);
        }
        fold
    }

    pub fn apply(&mut self, event: AuditEvent) {
        self.events += 1;
        if !event.run_id.is_empty() {
            self.run_id = Some(event.run_id.clone());
        }
        match event.kind {
            AuditKind::Position => {
                let positions = event
                    .payload
                    .get("positions")
                    .cloned()
                    .map(serde_json::from_value::<Vec<PositionState>>);
                match positions {
                    Some(Ok(list)) => {
                        for position in list {
                            self.positions.insert(position.symbol.clone(), position);
                        }
                    }
                    Some(Err(e)) => warn!("position 事件解析失败, 忽略: {}", e),
                    None => {}
                }
            }
            AuditKind::Pnl => {
                let curve = event
                    .payload
                    .get("equity_curve")
                    .cloned()
                    .map(serde_json::from_value::<Vec<EquityPoint>>);
                match curve {
                    Some(Ok(points)) => self.equity_curve = points,
                    Some(Err(e)) => warn!("pnl 事件解析失败, 忽略: {}", e),
                    None => {}
                }
            }
            AuditKind::Allocator => self.allocator = Some(event.payload),
            AuditKind::Learner => match serde_json::from_value::<LearnerMeta>(event.payload) {
                Ok(meta) => self.learner = Some(meta),
                Err(e) => warn!("learner 事件解析失败, 忽略: {}", e),
            },
            AuditKind::Queue => self.queue = Some(event.payload),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
            && self.equity_curve.is_empty()
            && self.allocator.is_none()
            && self.learner.is_none()
            && self.queue.is_none()
    }

    /// 引擎状态；日志中不记录成交明细
    pub fn engine_state(&self) -> Option<EngineState> {
        if self.positions.is_empty() && self.equity_curve.is_empty() {
            return None;
        }
        Some(EngineState {
            positions: self.positions.values().cloned().collect(),
            equity_curve: self.equity_curve.clone(),
            trades: Vec::new(),
        })
    }

    /// 学习器状态，模型字节无法从日志恢复
    pub fn learner_state(&self) -> Option<LearnerState> {
        self.learner.as_ref().map(|meta| LearnerState {
            algo: meta.algo.clone(),
            model: None,
            meta: meta.meta.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: AuditKind, payload: Value) -> AuditEvent {
        AuditEvent::new(kind, "run-1", payload)
    }

    #[test]
    fn keeps_latest_per_symbol_and_latest_curve() {
        let fold = ReplayFold::from_events(vec![
            event(
                AuditKind::Position,
                json!({"positions": [
                    {"symbol": "BTC-USDT", "qty": 1.0, "avg_price": 100.0},
                    {"symbol": "ETH-USDT", "qty": 2.0, "avg_price": 10.0}
                ]}),
            ),
            event(
                AuditKind::Pnl,
                json!({"equity_curve": [{"idx": 0, "ts": 1, "equity": 1000.0}]}),
            ),
            event(
                AuditKind::Position,
                json!({"positions": [{"symbol": "BTC-USDT", "qty": 0.5, "avg_price": 120.0}]}),
            ),
            event(
                AuditKind::Pnl,
                json!({"equity_curve": [
                    {"idx": 0, "ts": 1, "equity": 1000.0},
                    {"idx": 1, "ts": 2, "equity": 1010.0}
                ]}),
            ),
        ]);

        assert_eq!(fold.positions.len(), 2);
        assert_eq!(fold.positions["BTC-USDT"].qty, 0.5);
        assert_eq!(fold.positions["ETH-USDT"].qty, 2.0);
        assert_eq!(fold.equity_curve.len(), 2);
        assert_eq!(fold.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn learner_restores_without_model() {
        let fold = ReplayFold::from_events(vec![
            event(AuditKind::Learner, json!({"algo": "sgd", "meta": {"epoch": 1}, "model_size": 8})),
            event(AuditKind::Learner, json!({"algo": "sgd", "meta": {"epoch": 2}, "model_size": 8})),
            event(AuditKind::Queue, json!({"pending": 3})),
        ]);
        let learner = fold.learner_state().unwrap();
        assert_eq!(learner.meta["epoch"], 2);
        assert!(learner.model.is_none());
        assert_eq!(fold.queue, Some(json!({"pending": 3})));
        assert!(fold.engine_state().is_none());
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let fold = ReplayFold::from_events(vec![
            event(AuditKind::Position, json!({"positions": "nope"})),
            event(AuditKind::Learner, json!({"no_algo": true})),
        ]);
        assert!(fold.is_empty());
        assert_eq!(fold.events, 2);
    }
}
