//! Conversions between `serde_json::Value` and Rhai `Dynamic`.

use rhai::{Array, Dynamic, FnPtr, ImmutableString, Map};
use serde_json::{Number, Value};

pub fn json_to_dynamic(val: &Value) -> Dynamic {
    match val {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from_int(i),
            None => n
                .as_f64()
                .map(Dynamic::from_float)
                .unwrap_or_else(|| Dynamic::from(n.to_string())),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(json_to_dynamic).collect()),
        Value::Object(obj) => {
            let map: Map = obj
                .iter()
                .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
                .collect();
            Dynamic::from_map(map)
        }
    }
}

pub fn dynamic_to_json(val: &Dynamic) -> Value {
    if val.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = val.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = val.as_int() {
        return Value::Number(Number::from(i));
    }
    if let Ok(f) = val.as_float() {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if val.is_string() {
        return Value::String(val.clone().cast::<ImmutableString>().to_string());
    }
    if val.is_array() {
        let items = val.clone().cast::<Array>();
        return Value::Array(items.iter().map(dynamic_to_json).collect());
    }
    if val.is_map() {
        return map_to_json(&val.clone().cast::<Map>());
    }
    if let Some(ptr) = val.clone().try_cast::<FnPtr>() {
        return Value::String(ptr.fn_name().to_string());
    }
    Value::String(val.to_string())
}

pub fn map_to_json(map: &Map) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_values_survive_conversion() {
        let value = json!({
            "intent": "memory_store",
            "confidence": 0.75,
            "entities": [{"type": "code", "value": 4512}],
            "captureScreen": null,
            "ok": true
        });
        assert_eq!(dynamic_to_json(&json_to_dynamic(&value)), value);
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert_eq!(dynamic_to_json(&Dynamic::from_float(f64::NAN)), Value::Null);
    }
}
