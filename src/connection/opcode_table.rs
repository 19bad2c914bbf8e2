use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::auth::Role;
use crate::registry::{ClientData, ProtocolHandler};


/// An active sub-protocol on a connection
#[derive(Clone)]
pub struct ProtocolBinding {
    pub my_opcode: u8,
    pub protocol_name: String,
    pub role: Role,
    pub handler: Arc<dyn ProtocolHandler>,
    pub client_data: ClientData,
}
impl Debug for ProtocolBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{:?}", self.protocol_name, self.my_opcode, self.role)
    }
}

/// Maps the peer's major opcodes to the protocols they are bound to. The peer's opcodes are
///  typically small and dense, so this is a table covering `his_min..=his_max`.
#[derive(Default)]
pub struct OpcodeTable {
    his_min: u8,
    entries: Vec<Option<ProtocolBinding>>,
}

impl OpcodeTable {
    pub fn add(&mut self, his_opcode: u8, binding: ProtocolBinding) {
        if self.entries.is_empty() {
            self.his_min = his_opcode;
        }
        else if his_opcode < self.his_min {
            let shift = (self.his_min - his_opcode) as usize;
            self.entries.splice(0..0, std::iter::repeat(None).take(shift));
            self.his_min = his_opcode;
        }

        let idx = (his_opcode - self.his_min) as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, None);
        }
        self.entries[idx] = Some(binding);
    }

    pub fn get(&self, his_opcode: u8) -> Option<&ProtocolBinding> {
        if his_opcode < self.his_min {
            return None;
        }
        self.entries.get((his_opcode - self.his_min) as usize)?
            .as_ref()
    }

    /// the peer's opcode and the binding for this side's opcode
    pub fn find_mine(&self, my_opcode: u8) -> Option<(u8, &ProtocolBinding)> {
        self.entries.iter()
            .enumerate()
            .find_map(|(idx, e)| match e {
                Some(b) if b.my_opcode == my_opcode => Some((self.his_min + idx as u8, b)),
                _ => None,
            })
    }

    pub fn find_by_name(&self, protocol_name: &str) -> Option<&ProtocolBinding> {
        self.entries.iter()
            .flatten()
            .find(|b| b.protocol_name == protocol_name)
    }

    pub fn remove_mine(&mut self, my_opcode: u8) -> Option<ProtocolBinding> {
        let (his_opcode, _) = self.find_mine(my_opcode)?;
        self.entries[(his_opcode - self.his_min) as usize].take()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
