//! Distributed consistency: interfaces, communicators and combine rules

mod comm;
mod consistency;
mod interface;

pub use comm::{ChannelCommunicator, Communicator, Packet, SerialCommunicator};
pub use consistency::{
    global_defect_norm, global_dot, global_norm, matrix_consistent, matrix_diag_consistent,
    vector_collect, vector_consistent, vector_consistent_in_block, vector_consistent_noskip,
    vector_maximum, vector_mean_value, vector_minimum, vector_overwrite_from_master,
    vector_project_to_ghosts, vector_skip_exchange,
};
pub use interface::{Interface, InterfaceKind, InterfaceLink, LevelInterfaces};
