use serde::{Deserialize, Serialize};
use std::fmt;

const XZ_MASK: i64 = 0x3FF_FFFF;
const Y_MASK: i64 = 0xFFF;

/// Bit layout of a block position packed into one `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionEncoding {
    /// x:26 | y:12 | z:26, used before protocol 477.
    Xyz,
    /// x:26 | z:26 | y:12, used from protocol 477 on.
    Xzy,
}

/// Integer block coordinates in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Whether every coordinate fits its packed field without truncation.
    pub fn is_packable(&self) -> bool {
        const XZ_LIMIT: i32 = 1 << 25;
        const Y_LIMIT: i32 = 1 << 11;
        (-XZ_LIMIT..XZ_LIMIT).contains(&self.x)
            && (-XZ_LIMIT..XZ_LIMIT).contains(&self.z)
            && (-Y_LIMIT..Y_LIMIT).contains(&self.y)
    }

    pub fn pack(self, encoding: PositionEncoding) -> i64 {
        let x = i64::from(self.x) & XZ_MASK;
        let y = i64::from(self.y) & Y_MASK;
        let z = i64::from(self.z) & XZ_MASK;
        match encoding {
            PositionEncoding::Xyz => (x << 38) | (y << 26) | z,
            PositionEncoding::Xzy => (x << 38) | (z << 12) | y,
        }
    }

    /// Every `i64` unpacks to some position and packs back to itself, because
    /// the three fields cover all 64 bits.
    pub fn unpack(packed: i64, encoding: PositionEncoding) -> Self {
        // Arithmetic shifts sign-extend each field.
        let x = packed >> 38;
        let (y, z) = match encoding {
            PositionEncoding::Xyz => ((packed << 26) >> 52, (packed << 38) >> 38),
            PositionEncoding::Xzy => ((packed << 52) >> 52, (packed << 26) >> 38),
        };
        Self {
            x: x as i32,
            y: y as i32,
            z: z as i32,
        }
    }
}

impl From<(i32, i32, i32)> for BlockPos {
    fn from((x, y, z): (i32, i32, i32)) -> Self {
        Self::new(x, y, z)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}
