#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Region base is not page aligned or the region is empty.
    InvalidRegion(usize),
    /// Region exceeds what the allocator's bookkeeping can describe.
    RegionTooLarge { pages: usize, max: usize },
    /// Requested block order is not supported by this instance.
    InvalidOrder(usize),
    /// Address does not belong to the managed region.
    OutOfRange(usize),
    /// Zero size, oversized request, empty or overlong name.
    BadArgs,
    /// The page provider could not supply a block.
    NoMemory,
    /// The descriptor cache's own name may not be used.
    ReservedName,
    /// Null argument where an object was required.
    NullArg,
    /// Cache is not registered with this allocator.
    UnknownCache,
    /// Object does not belong to any slab of the target cache.
    UnknownObject,
    /// Pointer is inside a slab but not on an object boundary.
    MisalignedObject,
    /// Bump allocator cursor reached the end of its region.
    BumpExhausted(usize),
}

impl Error {
    /// Numeric code recorded in a cache descriptor for the C-like error
    /// inspection interface. Page-layer errors map to 0 (not cache-visible).
    pub fn code(&self) -> u8 {
        match self {
            Error::BadArgs => 1,
            Error::NoMemory => 2,
            Error::ReservedName => 3,
            Error::NullArg => 4,
            Error::UnknownCache => 5,
            Error::UnknownObject => 6,
            Error::MisalignedObject => 7,
            _ => 0,
        }
    }

    /// Inverse of [`Error::code`] for codes a cache can record.
    pub fn from_code(code: u8) -> Option<Error> {
        match code {
            1 => Some(Error::BadArgs),
            2 => Some(Error::NoMemory),
            3 => Some(Error::ReservedName),
            4 => Some(Error::NullArg),
            5 => Some(Error::UnknownCache),
            6 => Some(Error::UnknownObject),
            7 => Some(Error::MisalignedObject),
            _ => None,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidRegion(addr) => {
                write!(f, "invalid region base `{addr:#x}`")
            }
            Error::RegionTooLarge { pages, max } => {
                write!(f, "region of {pages} pages exceeds supported {max}")
            }
            Error::InvalidOrder(order) => write!(f, "unsupported block order {order}"),
            Error::OutOfRange(addr) => write!(f, "address `{addr:#x}` outside managed region"),
            Error::BadArgs => write!(f, "invalid arguments"),
            Error::NoMemory => write!(f, "out of memory"),
            Error::ReservedName => write!(f, "descriptor cache name is reserved"),
            Error::NullArg => write!(f, "null argument"),
            Error::UnknownCache => write!(f, "cache not registered"),
            Error::UnknownObject => write!(f, "object not owned by cache"),
            Error::MisalignedObject => write!(f, "pointer not on an object boundary"),
            Error::BumpExhausted(bytes) => {
                write!(f, "bump allocator exhausted, requested {bytes} bytes")
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
