//! Settings bundle payload codec.
//!
//! A bundle travels as one line of text:
//!
//! ```text
//! ("blueshift.conf", [Setting(name="gamma", title="Gamma", type="float",
//!     default=1.0, current=1.0, minimum=0.1, maximum=5.0, epsilon=0.01,
//!     values=None), ...])
//! ```
//!
//! Decoding accepts exactly this shape: a two-element tuple of script and
//! list of `Setting` records, each record carrying every field once.

mod parser;

pub use parser::{MalformedPayload, MAX_DEPTH};

use crate::settings::{Number, Setting, SettingParts, SettingsBundle, Value, ValueType};
use parser::{write_float, write_string, Field, Literal, Node};

/// Record tag of a setting.
const SETTING_TAG: &str = "Setting";

/// Fields of a setting record, in encoding order.
const FIELDS: [&str; 9] = [
    "name", "title", "type", "default", "current", "minimum", "maximum", "epsilon", "values",
];

/// Encode a bundle as a single line.
pub fn encode(bundle: &SettingsBundle) -> String {
    let mut out = String::with_capacity(64 + bundle.len() * 160);
    out.push('(');
    match bundle.script() {
        Some(script) => write_string(&mut out, script),
        None => out.push_str("None"),
    }
    out.push_str(", [");
    for (i, setting) in bundle.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        encode_setting(&mut out, setting);
    }
    out.push_str("])");
    out
}

fn encode_setting(out: &mut String, setting: &Setting) {
    out.push_str(SETTING_TAG);
    out.push_str("(name=");
    write_string(out, setting.name());
    out.push_str(", title=");
    write_string(out, setting.title());
    out.push_str(", type=");
    write_string(out, setting.value_type().as_str());
    out.push_str(", default=");
    encode_value(out, setting.default_value());
    out.push_str(", current=");
    encode_value(out, setting.current_value());
    out.push_str(", minimum=");
    encode_number(out, setting.minimum());
    out.push_str(", maximum=");
    encode_number(out, setting.maximum());
    out.push_str(", epsilon=");
    encode_number(out, setting.epsilon());
    out.push_str(", values=");
    match setting.possible_values() {
        Some(values) => encode_list(out, values),
        None => out.push_str("None"),
    }
    out.push(')');
}

fn encode_value(out: &mut String, value: &Value) {
    match value {
        Value::Str(s) => write_string(out, s),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(x) => write_float(out, *x),
        Value::List(items) => encode_list(out, items),
    }
}

fn encode_list(out: &mut String, items: &[Value]) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        encode_value(out, item);
    }
    out.push(']');
}

fn encode_number(out: &mut String, number: Option<Number>) {
    match number {
        Some(Number::Int(i)) => out.push_str(&i.to_string()),
        Some(Number::Float(x)) => write_float(out, x),
        None => out.push_str("None"),
    }
}

/// Decode a bundle payload.
pub fn decode(text: &str) -> Result<SettingsBundle, MalformedPayload> {
    let root = parser::parse(text)?;
    let mut parts = match root.literal {
        Literal::Tuple(items) if items.len() == 2 => items.into_iter(),
        other => {
            return Err(MalformedPayload::new(
                root.offset,
                format!("expected (script, [settings]), found {}", other.describe()),
            ))
        }
    };
    let (Some(script), Some(records)) = (parts.next(), parts.next()) else {
        return Err(MalformedPayload::new(root.offset, "expected (script, [settings])"));
    };

    let script = match script.literal {
        Literal::Str(s) => Some(s),
        Literal::None => None,
        other => {
            return Err(MalformedPayload::new(
                script.offset,
                format!("script must be a string or None, found {}", other.describe()),
            ))
        }
    };

    let records = match records.literal {
        Literal::List(records) => records,
        other => {
            return Err(MalformedPayload::new(
                records.offset,
                format!("settings must be a list, found {}", other.describe()),
            ))
        }
    };

    let mut bundle = SettingsBundle::with_script(script);
    for record in records {
        let offset = record.offset;
        let setting = decode_setting(record)?;
        bundle
            .add(setting)
            .map_err(|e| MalformedPayload::new(offset, e.to_string()))?;
    }
    Ok(bundle)
}

fn decode_setting(node: Node) -> Result<Setting, MalformedPayload> {
    let offset = node.offset;
    let fields = match node.literal {
        Literal::Record { tag, fields } if tag == SETTING_TAG => fields,
        Literal::Record { tag, .. } => {
            return Err(MalformedPayload::new(
                offset,
                format!("unknown record `{}`", tag),
            ))
        }
        other => {
            return Err(MalformedPayload::new(
                offset,
                format!("expected a Setting record, found {}", other.describe()),
            ))
        }
    };

    let mut slots: [Option<Node>; 9] = Default::default();
    for Field {
        offset,
        name,
        value,
    } in fields
    {
        let Some(i) = FIELDS.iter().position(|&f| f == name) else {
            return Err(MalformedPayload::new(
                offset,
                format!("unknown field `{}`", name),
            ));
        };
        if slots[i].is_some() {
            return Err(MalformedPayload::new(
                offset,
                format!("field `{}` given twice", name),
            ));
        }
        slots[i] = Some(value);
    }

    let mut slots = slots.into_iter().zip(FIELDS);
    let mut take = || -> Result<Node, MalformedPayload> {
        match slots.next() {
            Some((Some(node), _)) => Ok(node),
            Some((None, name)) => Err(MalformedPayload::new(
                offset,
                format!("missing field `{}`", name),
            )),
            None => Err(MalformedPayload::new(offset, "missing field")),
        }
    };

    let name = string(take()?)?;
    let title = string(take()?)?;
    let type_node = take()?;
    let type_offset = type_node.offset;
    let type_name = string(type_node)?;
    let value_type = ValueType::from_name(&type_name).ok_or_else(|| {
        MalformedPayload::new(type_offset, format!("unknown value type `{}`", type_name))
    })?;
    let default_value = value(take()?)?;
    let current_value = value(take()?)?;
    let minimum = number(take()?)?;
    let maximum = number(take()?)?;
    let epsilon = number(take()?)?;
    let values_node = take()?;
    let possible_values = match values_node.literal {
        Literal::None => None,
        Literal::List(items) => Some(
            items
                .into_iter()
                .map(value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other => {
            return Err(MalformedPayload::new(
                values_node.offset,
                format!("values must be a list or None, found {}", other.describe()),
            ))
        }
    };

    Setting::from_parts(SettingParts {
        name,
        title,
        value_type,
        default_value,
        current_value,
        minimum,
        maximum,
        epsilon,
        possible_values,
    })
    .map_err(|e| MalformedPayload::new(offset, e.to_string()))
}

fn string(node: Node) -> Result<String, MalformedPayload> {
    match node.literal {
        Literal::Str(s) => Ok(s),
        other => Err(MalformedPayload::new(
            node.offset,
            format!("expected a string, found {}", other.describe()),
        )),
    }
}

fn value(node: Node) -> Result<Value, MalformedPayload> {
    match node.literal {
        Literal::Str(s) => Ok(Value::Str(s)),
        Literal::Int(i) => Ok(Value::Int(i)),
        Literal::Float(x) => Ok(Value::Float(x)),
        Literal::List(items) => items
            .into_iter()
            .map(value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        other => Err(MalformedPayload::new(
            node.offset,
            format!("expected a value, found {}", other.describe()),
        )),
    }
}

fn number(node: Node) -> Result<Option<Number>, MalformedPayload> {
    match node.literal {
        Literal::None => Ok(None),
        Literal::Int(i) => Ok(Some(Number::Int(i))),
        Literal::Float(x) => Ok(Some(Number::Float(x))),
        other => Err(MalformedPayload::new(
            node.offset,
            format!("expected a number or None, found {}", other.describe()),
        )),
    }
}
