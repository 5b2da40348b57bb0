//! CIL instruction streams
//!
//! ### Structure
//!
//! A method body on disk is just a byte string of IL along with a table of exception clauses,
//! both of which refer to code by byte offset. That makes it painful to edit: inserting a single
//! instruction shifts every offset after it. Instead, a [`MethodBody`] holds its instructions
//! in an arena and refers to them through [`InstrId`] handles:
//!
//!   - branch operands (including `switch` tables) are handles
//!   - exception handler boundaries are handles
//!   - sequence points are attached to handles
//!
//! The order the instructions are laid out in is a separate list of handles, so inserting or
//! appending is just a list operation.
//!
//! ### Encoding
//!
//! Offsets only come back when the body is [encoded](MethodBody::encode). This is also the
//! point at which short branch forms get widened if their target ended up out of range.

mod body;
mod codec;
mod instruction;
mod opcode;

pub use body::*;
pub use codec::OffsetMap;
pub use instruction::*;
pub use opcode::*;
