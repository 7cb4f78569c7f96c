//! Overlay addresses and the proximity calculus they obey.
//!
//! The overlay address is the routing key of the network: a fixed-width
//! opaque byte string. Two metrics are defined over addresses:
//!
//! - **Proximity order (po)**: the number of leading bits two addresses
//!   share. `po(a, a)` saturates at [`MAX_PO`].
//! - **XOR distance**: the big-endian integer cast of `a ^ b`. The total
//!   order of distances agrees with the proximity order: a higher po
//!   always means a smaller distance.

mod address;
mod distance;
mod proximity;

pub use address::{AddressError, OverlayAddress, ADDRESS_LENGTH, BIT_LENGTH, MAX_PO};
pub use distance::{distance_between, distance_cmp_slices};
pub use proximity::{proximity_slices, ProximityError};
