//! Wire format of the Stable Diffusion WebUI (Forge) HTTP API.

use crate::error::ServiceError;
use crate::service::{RawImageSet, ServiceCapabilities, ServicePayload};
use base64::{engine::general_purpose, Engine};
use serde::Deserialize;
use serde_json::{json, Value};

pub(crate) const PROGRESS_PATH: &str = "/sdapi/v1/progress";
pub(crate) const SCRIPTS_PATH: &str = "/sdapi/v1/scripts";
pub(crate) const OPTIONS_PATH: &str = "/sdapi/v1/options";
pub(crate) const CONTROLNET_MODELS_PATH: &str = "/controlnet/model_list";
pub(crate) const TXT2IMG_PATH: &str = "/sdapi/v1/txt2img";

const ADAPTER_MODULE: &str = "ip-adapter_clip_h";
const POSE_MODULE: &str = "openpose_full";
const FACE_DETECTOR_MODEL: &str = "face_yolov8n.pt";
const FALLBACK_SAMPLER: &str = "Euler";
const REGION_SEPARATOR: &str = " BREAK ";
const ERROR_BODY_LIMIT: usize = 1000;

/// Build the txt2img request body.
pub(crate) fn txt2img_body(payload: &ServicePayload) -> Value {
    let sampling = &payload.sampling;
    let sampler = if sampling.sampler.trim().is_empty() {
        FALLBACK_SAMPLER
    } else {
        sampling.sampler.as_str()
    };

    let prompt = match &payload.regions {
        Some(regions) => {
            let mut segments = Vec::with_capacity(regions.region_prompts.len() + 1);
            if !payload.prompt.is_empty() {
                segments.push(payload.prompt.as_str());
            }
            segments.extend(regions.region_prompts.iter().map(String::as_str));
            segments.join(REGION_SEPARATOR)
        }
        None => payload.prompt.clone(),
    };

    let mut body = json!({
        "prompt": prompt,
        "negative_prompt": payload.negative_prompt,
        "width": sampling.width,
        "height": sampling.height,
        "steps": sampling.steps,
        "cfg_scale": sampling.cfg_scale,
        "seed": sampling.seed.unwrap_or(-1),
        "sampler_name": sampler,
        "batch_size": sampling.batch_size.max(1),
        "n_iter": 1,
        "save_images": false,
        "send_images": true,
    });

    let mut scripts = serde_json::Map::new();

    let mut units = Vec::new();
    if let Some(adapter) = &payload.feature_adapter {
        units.push(json!({
            "enabled": true,
            "module": ADAPTER_MODULE,
            "model": adapter.model,
            "image": general_purpose::STANDARD.encode(adapter.image.as_slice()),
            "weight": adapter.strength,
            "resize_mode": "Crop and Resize",
            "control_mode": "Balanced",
        }));
    }
    if let Some(pose) = &payload.pose {
        units.push(json!({
            "enabled": true,
            "module": POSE_MODULE,
            "model": pose.model,
            "image": general_purpose::STANDARD.encode(&pose.image),
            "weight": pose.weight,
            "resize_mode": "Crop and Resize",
            "control_mode": "Balanced",
        }));
    }
    if !units.is_empty() {
        scripts.insert("ControlNet".to_string(), json!({ "args": units }));
    }

    if let Some(regions) = &payload.regions {
        let use_common = !payload.prompt.is_empty();
        // Positional arguments of the Regional Prompter extension.
        let args = json!([
            true,
            false,
            "Matrix",
            regions.direction.as_str(),
            "Mask",
            "Prompt",
            format_ratios(&regions.ratios),
            "0",
            false,
            use_common,
            true,
            "Attention",
            false,
            "0",
            "0",
            "0",
            "",
            "0",
            "0",
            false
        ]);
        scripts.insert("Regional Prompter".to_string(), json!({ "args": args }));
    }

    if payload.face_correction {
        scripts.insert(
            "ADetailer".to_string(),
            json!({
                "args": [
                    true,
                    false,
                    {
                        "ad_model": FACE_DETECTOR_MODEL,
                        "ad_prompt": "",
                        "ad_negative_prompt": "",
                        "ad_confidence": 0.3,
                        "ad_denoising_strength": 0.4,
                    }
                ]
            }),
        );
    }

    if !scripts.is_empty() {
        body["alwayson_scripts"] = Value::Object(scripts);
    }
    body
}

/// Ratios as the comma list the extension expects, e.g. `0.5,0.5`.
pub(crate) fn format_ratios(ratios: &[f32]) -> String {
    ratios
        .iter()
        .map(|r| {
            let s = format!("{:.3}", r);
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    info: Option<Value>,
}

/// Decode a txt2img response body into raw images and reported seeds.
pub(crate) fn decode_txt2img(body: &str) -> Result<RawImageSet, ServiceError> {
    let response: Txt2ImgResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::MalformedResponse(format!("invalid JSON body: {}", e)))?;

    if response.images.is_empty() {
        return Err(ServiceError::MalformedResponse(
            "response contained no images".to_string(),
        ));
    }

    let images = response
        .images
        .iter()
        .enumerate()
        .map(|(index, encoded)| {
            decode_image(encoded).map_err(|e| {
                ServiceError::MalformedResponse(format!("image {} is not valid base64: {}", index, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RawImageSet {
        images,
        seeds: response.info.as_ref().map(reported_seeds).unwrap_or_default(),
    })
}

fn decode_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let data = match encoded.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => encoded,
    };
    general_purpose::STANDARD.decode(data.trim())
}

/// `info` is a JSON document serialized into a string; older builds send it as an object.
fn reported_seeds(info: &Value) -> Vec<i64> {
    let parsed;
    let info = match info {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => {
                parsed = value;
                &parsed
            }
            Err(_) => return Vec::new(),
        },
        other => other,
    };

    if let Some(all) = info.get("all_seeds").and_then(Value::as_array) {
        let seeds: Vec<i64> = all.iter().filter_map(Value::as_i64).collect();
        if !seeds.is_empty() {
            return seeds;
        }
    }
    info.get("seed")
        .and_then(Value::as_i64)
        .map(|seed| vec![seed])
        .unwrap_or_default()
}

/// Human-readable reason from a non-2xx body.
pub(crate) fn rejection_reason(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| error_detail(&value));
    match detail {
        Some(detail) => format!("HTTP {}: {}", status, detail),
        None if body.trim().is_empty() => format!("HTTP {}", status),
        None => format!("HTTP {}: {}", status, truncate(body.trim(), ERROR_BODY_LIMIT)),
    }
}

fn error_detail(value: &Value) -> Option<String> {
    if let Some(detail) = value.get("detail") {
        return match detail {
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| {
                        let loc = item
                            .get("loc")
                            .and_then(Value::as_array)
                            .map(|loc| {
                                loc.iter()
                                    .map(|p| match p {
                                        Value::String(s) => s.clone(),
                                        other => other.to_string(),
                                    })
                                    .collect::<Vec<_>>()
                                    .join(".")
                            })
                            .unwrap_or_default();
                        let msg = item.get("msg").and_then(Value::as_str).unwrap_or("invalid");
                        if loc.is_empty() {
                            msg.to_string()
                        } else {
                            format!("{}: {}", loc, msg)
                        }
                    })
                    .collect();
                Some(parts.join("; "))
            }
            other => Some(other.to_string()),
        };
    }
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Some(match value.get("errors").and_then(Value::as_str) {
            Some(errors) if !errors.is_empty() => format!("{}: {}", error, errors),
            _ => error.to_string(),
        });
    }
    value
        .get("errors")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(limit).collect();
        cut.push_str("...");
        cut
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ScriptList {
    #[serde(default)]
    pub txt2img: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ModelList {
    #[serde(default)]
    pub model_list: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Options {
    #[serde(default)]
    pub sd_model_checkpoint: Option<String>,
}

/// Derive capabilities from installed txt2img scripts and ControlNet models.
pub(crate) fn capabilities_from(scripts: &ScriptList, models: &ModelList) -> ServiceCapabilities {
    let names: Vec<String> = scripts.txt2img.iter().map(|s| s.to_lowercase()).collect();
    let has_controlnet = names.iter().any(|s| s.contains("controlnet"));

    let (feature_adapter, pose_conditioning) = if has_controlnet {
        (
            best_adapter_model(&models.model_list),
            models
                .model_list
                .iter()
                .find(|m| m.to_lowercase().contains("openpose"))
                .cloned(),
        )
    } else {
        (None, None)
    };

    ServiceCapabilities {
        feature_adapter,
        pose_conditioning,
        multi_region: names
            .iter()
            .any(|s| s.contains("regional") && s.contains("prompt")),
        face_correction: names
            .iter()
            .any(|s| s.contains("adetailer") || s.contains("after detailer")),
    }
}

/// Prefer an SDXL adapter, then SD 1.5, then anything that looks like an adapter.
fn best_adapter_model(models: &[String]) -> Option<String> {
    let adapters: Vec<&String> = models
        .iter()
        .filter(|m| {
            let lower = m.to_lowercase();
            lower.contains("ip-adapter") || lower.contains("ip_adapter")
        })
        .collect();
    ["sdxl", "sd15"]
        .iter()
        .find_map(|family| {
            adapters
                .iter()
                .find(|m| m.to_lowercase().contains(family))
                .map(|m| (*m).clone())
        })
        .or_else(|| adapters.first().map(|m| (*m).clone()))
}
