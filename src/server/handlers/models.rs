use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;
use serde_json::{Value, json};

use crate::routing::model_tiers::{MODEL_PRICING, ModelTier, equivalents, model_tier};
use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    id: &'static str,
    object: &'static str,
    owned_by: &'static str,
    tier: ModelTier,
    /// 美元 / 1K tokens
    input_price_per_k: f64,
    output_price_per_k: f64,
}

/// 只列出已注册 provider 的模型
pub async fn list_models(State(app_state): State<Arc<AppState>>) -> Json<Value> {
    let registry = app_state.engine.registry();
    let data: Vec<ModelEntry> = MODEL_PRICING
        .iter()
        .filter(|p| registry.get(p.provider).is_some())
        .map(|p| ModelEntry {
            id: p.model,
            object: "model",
            owned_by: p.provider.as_str(),
            tier: p.tier,
            input_price_per_k: p.input_price_per_k,
            output_price_per_k: p.output_price_per_k,
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

pub async fn model_equivalents(Path(model): Path<String>) -> Json<Value> {
    let map: BTreeMap<&str, &str> = equivalents(&model)
        .into_iter()
        .map(|(provider, m)| (provider.as_str(), m))
        .collect();
    Json(json!({
        "model": model,
        "tier": model_tier(&model),
        "equivalents": map,
    }))
}
