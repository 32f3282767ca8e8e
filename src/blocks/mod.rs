pub mod ublock;
pub mod cblock;
pub mod iblock;
pub mod mblock;
pub mod shblock;
pub mod ctrlblock;

pub use ublock::UBlock;
pub use cblock::CBlock;
pub use iblock::IBlock;
pub use mblock::{MBlock, MIntBlock, MMulBlock};
pub use shblock::ShBlock;
pub use ctrlblock::CtrlBlock;
