//! `tonic` codec bridging protobuf messages and JSON values.
//!
//! Messages are decoded into a [`DynamicMessage`] for the method's
//! descriptor and mapped to JSON with the proto3 JSON mapping, so handlers
//! only ever see `serde_json::Value`.

use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor, SerializeOptions};
use serde_json::Value;
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// Codec for one method. The server side decodes the method input and
/// encodes its output; the client side does the opposite.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    encode: MessageDescriptor,
    decode: MessageDescriptor,
}

impl JsonCodec {
    /// Server-side codec for `method`.
    pub fn server(method: &MethodDescriptor) -> Self {
        Self {
            encode: method.output(),
            decode: method.input(),
        }
    }

    /// Client-side codec for `method`.
    pub fn client(method: &MethodDescriptor) -> Self {
        Self {
            encode: method.input(),
            decode: method.output(),
        }
    }
}

impl Codec for JsonCodec {
    type Encode = Value;
    type Decode = Value;
    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder(self.encode.clone())
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder(self.decode.clone())
    }
}

/// Encodes JSON values as protobuf messages.
#[derive(Debug, Clone)]
pub struct JsonEncoder(MessageDescriptor);

impl Encoder for JsonEncoder {
    type Item = Value;
    type Error = Status;

    fn encode(&mut self, item: Value, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        let message = to_message(&self.0, item)?;
        message
            .encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode {}: {e}", self.0.full_name())))
    }
}

/// Decodes protobuf messages into JSON values.
#[derive(Debug, Clone)]
pub struct JsonDecoder(MessageDescriptor);

impl Decoder for JsonDecoder {
    type Item = Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Value>, Status> {
        let message = DynamicMessage::decode(self.0.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode {}: {e}", self.0.full_name())))?;
        to_json(&message).map(Some)
    }
}

/// Build a message from its JSON form.
pub fn to_message(descriptor: &MessageDescriptor, value: Value) -> Result<DynamicMessage, Status> {
    DynamicMessage::deserialize(descriptor.clone(), value).map_err(|e| {
        Status::internal(format!(
            "value does not match {}: {e}",
            descriptor.full_name()
        ))
    })
}

/// JSON form of a message. Fields holding their default value are kept.
pub fn to_json(message: &DynamicMessage) -> Result<Value, Status> {
    let options = SerializeOptions::new().skip_default_fields(false);
    message
        .serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|e| Status::internal(format!("failed to map message to JSON: {e}")))
}

/// The empty message in JSON form.
pub fn empty_message() -> Value {
    Value::Object(serde_json::Map::new())
}
