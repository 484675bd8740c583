//! Hex quantity codecs and block references used when building requests and decoding
//! responses.

pub mod block_param;
pub mod quantity;

pub use block_param::{BlockRef, BlockTag, ParseError as BlockParseError};
pub use quantity::{format_quantity, parse_quantity_i64, parse_quantity_u128, parse_quantity_u64, QuantityError};
