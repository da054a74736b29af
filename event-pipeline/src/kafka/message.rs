use rdkafka::message::Message;

use crate::coordinator::{RecordId, StreamRecord};

/// Copy a Kafka message into an owned `StreamRecord`. The payload stays undecoded:
/// decoding is part of record processing so a bad payload only affects its own outcome.
pub fn stream_record<M: Message>(message: &M) -> StreamRecord {
    StreamRecord::new(
        RecordId::new(message.topic(), message.partition(), message.offset()),
        message.payload().map(<[u8]>::to_vec),
    )
}
