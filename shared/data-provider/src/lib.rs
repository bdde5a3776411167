mod collate;
mod indexed;
mod instruction;
mod sampler;
mod traits;

pub use collate::{CollateError, CollatedBatch, LmCollator, SEPARATOR_TOKEN};
pub use indexed::{IndexedDataset, IndexedDatasetBuilder, IndexedDatasetError};
pub use instruction::{
    encode_instruction, format_prompt, EncodeOptions, EncodedInstruction, InstructionRecord,
    LengthStats, TextEncoder,
};
pub use sampler::DistributedPartition;
pub use traits::TokenDataset;
