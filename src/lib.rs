#![forbid(unsafe_code)]
pub mod expr;
pub mod filter;
pub mod graph;
pub mod op_node;
pub mod pattern;
pub mod profile;
pub mod regex;
pub(crate) mod sb_reader;
pub mod sbpl;


use std::io::Read;

use anyhow::{ensure, Result};

use sb_reader::SbRead;

pub use filter::{FilterCatalog, ModifierCatalog};
pub use profile::DecodedProfile;
pub use sbpl::{decompile_profile, DecompileOptions};

pub(crate) const INDEX_SIZE: u64 = 2;
pub(crate) const NODE_SIZE: u64 = 8;

/// Fixed header at offset 0 of a compiled sandbox profile.
///
/// The trailing counts (`states_count`, `num_profiles`,
/// `entitlements_count`) are not present in this header revision and
/// decode as zero, but they stay part of the layout arithmetic so a
/// future bundle header only has to fill them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileHeader {
    pub profile_type: u16,
    pub op_nodes_count: u16,
    pub sb_ops_count: u8,
    pub vars_count: u8,
    pub regex_count: u16,
    pub states_count: u16,
    pub num_profiles: u16,
    pub entitlements_count: u16,
}

impl ProfileHeader {
    pub const SIZE: u64 = 16;

    pub fn read(input: &mut impl Read) -> Result<Self> {
        let profile_type = input.read_u16()?;
        let op_nodes_count = input.read_u16()?;
        let sb_ops_count = input.read_u8()?;
        let vars_count = input.read_u8()?;
        let _padding: [u8; 6] = bincode::deserialize_from(&mut *input)?;
        let regex_count = input.read_u16()?;
        let _reserved = input.read_u16()?;
        #[cfg(feature = "restrictive")]
        {
            ensure!(_padding == [0; 6], "non-zero header padding");
            ensure!(_reserved == 0, "non-zero reserved header field");
        }
        Ok(Self {
            profile_type,
            op_nodes_count,
            sb_ops_count,
            vars_count,
            regex_count,
            states_count: 0,
            num_profiles: 0,
            entitlements_count: 0,
        })
    }

    pub fn regex_table_offset(&self) -> u64 {
        Self::SIZE
    }

    pub fn vars_offset(&self) -> u64 {
        self.regex_table_offset() + u64::from(self.regex_count) * INDEX_SIZE
    }

    pub fn states_offset(&self) -> u64 {
        self.vars_offset() + u64::from(self.vars_count) * INDEX_SIZE
    }

    pub fn entitlements_offset(&self) -> u64 {
        self.states_offset() + u64::from(self.states_count) * INDEX_SIZE
    }

    pub fn profiles_offset(&self) -> u64 {
        self.entitlements_offset()
            + u64::from(self.entitlements_count) * INDEX_SIZE
    }

    /// Per-profile record: one dispatch slot per operation plus a
    /// 4-byte preamble.
    pub fn profile_record_size(&self) -> u64 {
        u64::from(self.sb_ops_count) * INDEX_SIZE + 4
    }

    pub fn profiles_end_offset(&self) -> u64 {
        self.profiles_offset()
            + u64::from(self.num_profiles) * self.profile_record_size()
    }

    pub fn op_table_offset(&self) -> u64 {
        self.profiles_end_offset()
    }

    pub fn operation_nodes_offset(&self) -> u64 {
        align_up(
            self.op_table_offset() + u64::from(self.sb_ops_count) * INDEX_SIZE,
            8,
        )
    }

    pub fn operation_nodes_size(&self) -> u64 {
        u64::from(self.op_nodes_count) * NODE_SIZE
    }

    /// First byte past the operation-node array. Every indirect
    /// reference `o` in the file resolves to `base_addr + 8 * o`.
    pub fn base_addr(&self) -> u64 {
        self.operation_nodes_offset() + self.operation_nodes_size()
    }

    /// The count fields are authoritative; reject any layout they
    /// imply that does not fit the mapped file.
    pub fn validate(&self, file_len: u64) -> Result<()> {
        ensure!(
            self.operation_nodes_offset() <= file_len,
            "header tables extend past end of file ({} > {file_len})",
            self.operation_nodes_offset(),
        );
        ensure!(
            self.base_addr() <= file_len,
            "operation nodes extend past end of file ({} > {file_len})",
            self.base_addr(),
        );
        Ok(())
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}
