use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{Command, CommandResult, OperationRecord, WorkerId};

/// Default TCP port of the coordinator.
pub const DEFAULT_COORDINATOR_PORT: u16 = 3490;

/// Message sent by a worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum WorkerMessage {
    /// First message of a connection.
    Register {
        /// PID of the traced process.
        pid: u32,
    },

    /// A message operation was intercepted.
    Event(OperationRecord),

    /// The last received command has completed.
    CommandDone(CommandResult),
}

/// Message sent by the coordinator to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum CoordinatorMessage {
    /// Reply to [WorkerMessage::Register].
    Registered {
        /// ID assigned to the worker.
        worker_id: WorkerId,
    },

    /// Command to execute.
    Command(Command),
}

/// Length-delimited bincode codec, decoding `D` and encoding `E`.
pub struct MessageCodec<D, E> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

/// Codec used on the worker side of a connection.
pub type WorkerCodec = MessageCodec<CoordinatorMessage, WorkerMessage>;

/// Codec used on the coordinator side of a connection.
pub type CoordinatorCodec = MessageCodec<WorkerMessage, CoordinatorMessage>;

impl<D, E> MessageCodec<D, E> {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for MessageCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for MessageCodec<D, E> {
    type Item = D;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<D>> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };

        let (item, _) = bincode::serde::decode_from_slice(&frame, bincode::config::standard())?;

        Ok(Some(item))
    }
}

impl<D, E: Serialize> Encoder<E> for MessageCodec<D, E> {
    type Error = crate::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> crate::Result<()> {
        let payload = bincode::serde::encode_to_vec(&item, bincode::config::standard())?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{CoordinatorCodec, WorkerCodec, WorkerMessage};
    use crate::{OperationRecord, WorkerId};

    #[test]
    fn partial_frames_are_buffered() {
        let record = OperationRecord {
            checkpoint_id: "0123456789".into(),
            op_name: "MPI_Recv".to_owned(),
            parameters: BTreeMap::from([("tag".to_owned(), "4".to_owned())]),
            worker_id: WorkerId(2),
        };

        let mut buf = BytesMut::new();
        WorkerCodec::new()
            .encode(WorkerMessage::Event(record.clone()), &mut buf)
            .unwrap();
        WorkerCodec::new()
            .encode(WorkerMessage::Register { pid: 7 }, &mut buf)
            .unwrap();

        let mut decoder = CoordinatorCodec::new();
        let mut partial = buf.split_to(3);
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(
            decoder.decode(&mut partial).unwrap(),
            Some(WorkerMessage::Event(record))
        );
        assert_eq!(
            decoder.decode(&mut partial).unwrap(),
            Some(WorkerMessage::Register { pid: 7 })
        );
        assert!(decoder.decode(&mut partial).unwrap().is_none());
    }
}
