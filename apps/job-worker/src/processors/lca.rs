//! Life cycle assessment - carbon footprint from per-stage emission factors.

use async_trait::async_trait;
use serde_json::json;
use verdant_core::domain::{Job, JobOutput, JobPayload, LcaCalculationPayload};
use verdant_core::ports::{JobProcessor, ProcessorError, ProgressReporter};

/// kg CO2e per functional unit.
const MATERIALS_FACTOR: f64 = 12.5;
const TRANSPORT_FACTOR: f64 = 3.2;
const PROCESSING_FACTOR: f64 = 4.8;

/// Characterisation multiplier for each supported method.
fn method_multiplier(method: &str) -> Option<f64> {
    match method.to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
        "ISO14040" | "ISO_14040" | "ISO14044" | "ISO_14044" => Some(1.0),
        "GHG_PROTOCOL" => Some(1.05),
        "PEF" => Some(1.1),
        _ => None,
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub struct LcaProcessor;

impl LcaProcessor {
    fn calculate(payload: &LcaCalculationPayload) -> Result<serde_json::Value, ProcessorError> {
        let multiplier = method_multiplier(&payload.calculation_method).ok_or_else(|| {
            ProcessorError::permanent(format!(
                "Unsupported calculation method: {}",
                payload.calculation_method
            ))
        })?;

        let quantity = match payload.options.extra.get("quantity") {
            None => 1.0,
            Some(value) => value
                .as_f64()
                .filter(|q| *q > 0.0)
                .ok_or_else(|| ProcessorError::permanent("quantity must be a positive number"))?,
        };

        let scale = multiplier * quantity;
        let materials = MATERIALS_FACTOR * scale;
        let transport = if payload.options.include_transport {
            TRANSPORT_FACTOR * scale
        } else {
            0.0
        };
        let processing = if payload.options.include_processing {
            PROCESSING_FACTOR * scale
        } else {
            0.0
        };

        Ok(json!({
            "productId": payload.product_id,
            "calculationMethod": payload.calculation_method,
            "totalCarbonFootprint": round3(materials + transport + processing),
            "unit": "kgCO2e",
            "breakdown": {
                "materials": round3(materials),
                "transport": round3(transport),
                "processing": round3(processing),
            },
        }))
    }
}

#[async_trait]
impl JobProcessor for LcaProcessor {
    async fn process(
        &self,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<JobOutput, ProcessorError> {
        let JobPayload::LcaCalculation(payload) = &job.payload else {
            return Err(ProcessorError::permanent("expected an lca_calculation payload"));
        };

        progress.report(10).await;
        let result = Self::calculate(payload)?;
        tracing::debug!(
            job_id = %job.id,
            product_id = %payload.product_id,
            total = %result["totalCarbonFootprint"],
            "LCA calculated"
        );
        progress.report(100).await;

        Ok(JobOutput::json(result))
    }
}
