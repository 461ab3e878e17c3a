//! Building blocks of the TRACER decoder.

mod aggregation;
mod attention;
mod conv;
mod frequency;
mod object_attention;
mod rfb;

pub use aggregation::{Aggregation, AggregationConfig};
pub use attention::{UnionAttention, UnionAttentionConfig};
pub use conv::{
    BasicConv2d, BasicConv2dConfig, DWConv, DWConvConfig, DWSConv, DWSConvConfig, DilatedBranch,
    DilatedHead, DilatedHeadConfig,
};
pub use frequency::{FrequencyEdgeModule, FrequencyEdgeModuleConfig};
pub use object_attention::{ObjectAttention, ObjectAttentionConfig};
pub use rfb::{ReceptiveFieldBlock, ReceptiveFieldBlockConfig};
