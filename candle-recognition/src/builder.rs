//! Builds models from config records by dispatching on their `type` field.

use crate::backbones::{Backbone, ResNet, ResNet3d};
use crate::config::ConfigDict;
use crate::heads::{Head, I3DHead, TSNHead};
use crate::module::Recognizer;
use crate::params::ParamStore;
use crate::recognizers::{Recognizer2D, Recognizer3D, RecognizerBase};
use crate::{Error, Result};
use candle::{DType, Device};
use candle_nn::VarMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Splits a component record into its `type` and the remaining constructor arguments.
fn split_type(cfg: &Value, section: &'static str) -> Result<(String, Value)> {
    let Value::Object(map) = cfg else {
        return Err(Error::Config(format!("{section} must be an object, got {cfg}")));
    };
    let mut args = map.clone();
    let kind = match args.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(other) => {
            return Err(Error::Config(format!("{section}.type must be a string, got {other}")))
        }
        None => {
            return Err(Error::MissingConfig {
                section,
                key: "type".to_string(),
            })
        }
    };
    Ok((kind, Value::Object(args)))
}

fn args<T: DeserializeOwned>(section: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| Error::Config(format!("{section}: {e}")))
}

pub fn build_backbone(cfg: &Value, ps: &ParamStore) -> Result<Box<dyn Backbone>> {
    let (kind, rest) = split_type(cfg, "backbone")?;
    let backbone: Box<dyn Backbone> = match kind.as_str() {
        "ResNet3d" => Box::new(ResNet3d::new(ps, &args("backbone", rest)?)?),
        "ResNet" => Box::new(ResNet::new(ps, &args("backbone", rest)?)?),
        _ => {
            return Err(Error::UnknownType {
                kind: "backbone",
                name: kind,
            })
        }
    };
    Ok(backbone)
}

/// Builds a head and returns it with its `in_channels`.
fn build_head_with_channels(cfg: &Value, ps: &ParamStore) -> Result<(Box<dyn Head>, usize)> {
    let (kind, rest) = split_type(cfg, "cls_head")?;
    let built: (Box<dyn Head>, usize) = match kind.as_str() {
        "I3DHead" => {
            let head = I3DHead::new(ps, &args("cls_head", rest)?)?;
            let in_channels = head.config().in_channels;
            (Box::new(head), in_channels)
        }
        "TSNHead" => {
            let head = TSNHead::new(ps, &args("cls_head", rest)?)?;
            let in_channels = head.config().in_channels;
            (Box::new(head), in_channels)
        }
        _ => {
            return Err(Error::UnknownType {
                kind: "head",
                name: kind,
            })
        }
    };
    Ok(built)
}

pub fn build_head(cfg: &Value, ps: &ParamStore) -> Result<Box<dyn Head>> {
    Ok(build_head_with_channels(cfg, ps)?.0)
}

fn section(value: Option<&Value>, name: &str) -> Result<Option<ConfigDict>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(Error::Config(format!("{name} must be an object, got {other}"))),
    }
}

/// Builds a recognizer from its `model` record. Parameters are registered in `varmap`
/// under `backbone.*` and `cls_head.*`.
pub fn build_recognizer(
    model_cfg: &Value,
    train_cfg: Option<ConfigDict>,
    test_cfg: Option<ConfigDict>,
    varmap: &VarMap,
    device: &Device,
) -> Result<Box<dyn Recognizer>> {
    let (kind, rest) = split_type(model_cfg, "model")?;
    if !matches!(kind.as_str(), "Recognizer3D" | "Recognizer2D") {
        return Err(Error::UnknownType {
            kind: "recognizer",
            name: kind,
        });
    }
    let backbone_cfg = rest.get("backbone").ok_or(Error::MissingConfig {
        section: "model",
        key: "backbone".to_string(),
    })?;
    let head_cfg = rest.get("cls_head").ok_or(Error::MissingConfig {
        section: "model",
        key: "cls_head".to_string(),
    })?;

    let ps = ParamStore::new(varmap, DType::F32, device);
    let backbone = build_backbone(backbone_cfg, &ps.pp("backbone"))?;
    let (cls_head, in_channels) = build_head_with_channels(head_cfg, &ps.pp("cls_head"))?;
    if in_channels != backbone.out_channels() {
        return Err(Error::Config(format!(
            "cls_head.in_channels is {in_channels} but the backbone outputs {} channels",
            backbone.out_channels()
        )));
    }
    tracing::info!(recognizer = %kind, "building model");

    let base = RecognizerBase::new(backbone, cls_head, train_cfg, test_cfg, varmap.clone())?;
    let recognizer: Box<dyn Recognizer> = match kind.as_str() {
        "Recognizer2D" => Box::new(Recognizer2D::new(base)),
        _ => Box::new(Recognizer3D::new(base)),
    };
    Ok(recognizer)
}

/// Builds the recognizer of a whole experiment record.
///
/// `train_cfg` and `test_cfg` are read from `model` or from the top level, but not both.
pub fn build_model(experiment: &Value, varmap: &VarMap, device: &Device) -> Result<Box<dyn Recognizer>> {
    let model = experiment.get("model").ok_or(Error::MissingConfig {
        section: "experiment",
        key: "model".to_string(),
    })?;
    let mut model = model.clone();
    let mut pick = |name: &str| -> Result<Option<ConfigDict>> {
        let nested = match &mut model {
            Value::Object(map) => map.remove(name),
            _ => None,
        };
        let top = experiment.get(name);
        let nested_set = !matches!(nested, None | Some(Value::Null));
        let top_set = !matches!(top, None | Some(Value::Null));
        if nested_set && top_set {
            return Err(Error::Config(format!(
                "{name} is specified both in the top level and in model"
            )));
        }
        if nested_set {
            section(nested.as_ref(), name)
        } else {
            section(top, name)
        }
    };
    let train_cfg = pick("train_cfg")?;
    let test_cfg = pick("test_cfg")?;
    build_recognizer(&model, train_cfg, test_cfg, varmap, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> Value {
        json!({
            "type": "Recognizer3D",
            "backbone": {"type": "ResNet3d", "base_channels": 4, "stage_blocks": [1, 1]},
            "cls_head": {"type": "I3DHead", "num_classes": 3, "in_channels": 8},
        })
    }

    #[test]
    fn unknown_types_are_reported() {
        let varmap = VarMap::new();
        let ps = ParamStore::new(&varmap, DType::F32, &Device::Cpu);
        let err = build_backbone(&json!({"type": "SwinTransformer3D"}), &ps).err();
        assert!(matches!(err, Some(Error::UnknownType { kind: "backbone", .. })));
        let err = build_head(&json!({"type": "SlowFastHead"}), &ps).err();
        assert!(matches!(err, Some(Error::UnknownType { kind: "head", .. })));
        let mut cfg = model();
        cfg["type"] = json!("AudioRecognizer");
        let err = build_recognizer(&cfg, None, None, &varmap, &Device::Cpu).err();
        assert!(matches!(err, Some(Error::UnknownType { kind: "recognizer", .. })));
    }

    #[test]
    fn missing_type_is_a_missing_config() {
        let varmap = VarMap::new();
        let ps = ParamStore::new(&varmap, DType::F32, &Device::Cpu);
        let err = build_backbone(&json!({"depth": 50}), &ps).err();
        assert!(matches!(err, Some(Error::MissingConfig { section: "backbone", .. })));
    }

    #[test]
    fn head_channels_must_match_the_backbone() {
        let mut cfg = model();
        cfg["cls_head"]["in_channels"] = json!(16);
        let err = build_recognizer(&cfg, None, None, &VarMap::new(), &Device::Cpu).err();
        assert!(matches!(err, Some(Error::Config(_))));
    }

    #[test]
    fn test_cfg_is_read_from_either_place() -> Result<()> {
        let varmap = VarMap::new();
        let experiment = json!({"model": model(), "test_cfg": {"average_clips": "prob"}});
        let recognizer = build_model(&experiment, &varmap, &Device::Cpu)?;
        let test_cfg = recognizer.base().test_cfg().expect("test_cfg");
        assert_eq!(test_cfg["average_clips"], json!("prob"));
        assert!(varmap.data().lock().unwrap().contains_key("cls_head.fc_cls.weight"));

        let mut nested = model();
        nested["test_cfg"] = json!({"average_clips": "score"});
        let recognizer = build_model(&json!({"model": nested}), &VarMap::new(), &Device::Cpu)?;
        assert!(recognizer.base().train_cfg().is_none());
        assert_eq!(recognizer.base().test_cfg().expect("test_cfg")["average_clips"], json!("score"));

        let both = json!({"model": nested, "test_cfg": {"average_clips": "prob"}});
        let err = build_model(&both, &VarMap::new(), &Device::Cpu).err();
        assert!(matches!(err, Some(Error::Config(_))));
        Ok(())
    }
}
