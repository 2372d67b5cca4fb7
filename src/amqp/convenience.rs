//! Conversions between `lapin`'s [`BasicProperties`] and [`MessageProperties`].
use crate::transport::MessageProperties;
use amq_protocol_types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// The value of header `name`, if it holds a string.
    fn header_str(&self, name: &str) -> Option<Cow<'_, str>>;

    /// All headers holding a string value, keyed by header name.
    fn string_headers(&self) -> BTreeMap<String, String>;

    fn to_message_properties(&self) -> MessageProperties;
}

impl BasicPropertiesExt for BasicProperties {
    fn header_str(&self, name: &str) -> Option<Cow<'_, str>> {
        let name: ShortString = name.into();
        as_str(self.headers().as_ref()?.inner().get(&name)?)
    }

    fn string_headers(&self) -> BTreeMap<String, String> {
        let Some(headers) = self.headers().as_ref() else {
            return BTreeMap::new();
        };
        headers
            .inner()
            .iter()
            .filter_map(|(name, value)| {
                as_str(value).map(|value| (name.as_str().to_owned(), value.into_owned()))
            })
            .collect()
    }

    fn to_message_properties(&self) -> MessageProperties {
        MessageProperties {
            content_type: self.content_type().as_ref().map(|c| c.as_str().to_owned()),
            message_id: self.message_id().as_ref().map(|m| m.as_str().to_owned()),
            headers: self.string_headers(),
        }
    }
}

fn as_str(value: &AMQPValue) -> Option<Cow<'_, str>> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes())),
        AMQPValue::ShortString(s) => Some(Cow::Borrowed(s.as_str())),
        _ => None,
    }
}

/// The `lapin` properties to publish a message with.
///
/// Headers are sent as long strings.
pub fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic_properties = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic_properties = basic_properties.with_content_type(content_type.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic_properties = basic_properties.with_message_id(message_id.as_str().into());
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (name, value) in &properties.headers {
            headers.insert(name.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }
        basic_properties = basic_properties.with_headers(headers);
    }
    basic_properties
}
