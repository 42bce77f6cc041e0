// Length-prefixed JSON framing (spec §4.3: "Wire format: length-prefixed JSON messages").
//
// Each message is a big-endian u32 byte count followed by that many bytes of UTF-8 JSON. No
// gRPC/protobuf here despite the teacher's own sandboxer using tonic: the wire contract is
// specified in the engine's own terms, and a stage is expected to be able to speak it with
// nothing more exotic than `read`/`write` on the socket file descriptor it's handed.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::Value;

/// Read one framed JSON message, or `None` on a clean EOF between messages.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Option<Value>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    let value = serde_json::from_slice(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(Some(value))
}

pub fn write_message<W: Write>(writer: &mut W, value: &Value) -> io::Result<()> {
    let buf = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_u32::<BigEndian>(buf.len() as u32)?;
    writer.write_all(&buf)?;
    writer.flush()
}
