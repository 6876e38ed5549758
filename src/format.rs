//! Defines the instruction set of the pickle binary format.
//!
//! # Stream Layout
//! A pickle is a flat sequence of instructions terminated by `STOP`:
//!
//! `[PROTO n]? [FRAME len]? [Opcode Argument?] ... [STOP]`
//!
//! Every instruction is a single opcode byte followed by an argument whose
//! encoding is fixed per opcode (see [`ArgKind`]). Protocol 2 and later
//! streams open with the `PROTO` marker, whose one-byte argument is the
//! protocol version.

/// The opcode byte announcing the protocol version (`PROTO`).
pub const PROTO_MARKER: u8 = 0x80;

/// The newest protocol revision this crate understands.
pub const HIGHEST_PROTOCOL: u8 = 5;

/// How the argument of an instruction is encoded in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// No argument.
    None,
    /// Unsigned 1-byte integer.
    Uint1,
    /// Unsigned 2-byte little-endian integer.
    Uint2,
    /// Unsigned 4-byte little-endian integer.
    Uint4,
    /// Unsigned 8-byte little-endian integer.
    Uint8,
    /// Signed 4-byte little-endian integer.
    Int4,
    /// Two's complement integer prefixed by a 1-byte length.
    Long1,
    /// Two's complement integer prefixed by a signed 4-byte length.
    Long4,
    /// Big-endian IEEE 754 double.
    Float8,
    /// Newline-terminated decimal integer (`"01"`/`"00"` spell booleans).
    DecimalNlShort,
    /// Newline-terminated decimal integer with an optional trailing `L`.
    DecimalNlLong,
    /// Newline-terminated float literal.
    FloatNl,
    /// Newline-terminated quoted string literal.
    StringNl,
    /// Newline-terminated unquoted string.
    StringNlNoEscape,
    /// Two newline-terminated unquoted strings (module, name).
    StringNlNoEscapePair,
    /// Newline-terminated raw-unicode-escape text.
    UnicodeStringNl,
    /// Byte string prefixed by a 1-byte length.
    String1,
    /// Byte string prefixed by a signed 4-byte length.
    String4,
    /// Bytes prefixed by a 1-byte length.
    Bytes1,
    /// Bytes prefixed by a 4-byte length.
    Bytes4,
    /// Bytes prefixed by an 8-byte length.
    Bytes8,
    /// UTF-8 text prefixed by a 1-byte length.
    UnicodeString1,
    /// UTF-8 text prefixed by a 4-byte length.
    UnicodeString4,
    /// UTF-8 text prefixed by an 8-byte length.
    UnicodeString8,
    /// Mutable bytes prefixed by an 8-byte length.
    ByteArray8,
}

macro_rules! opcodes {
    ($( $variant:ident = $code:literal, $name:literal, $arg:ident, $proto:literal; )*) => {
        /// A single pickle instruction.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $(
                #[doc = $name]
                $variant,
            )*
        }

        impl Opcode {
            /// Every known opcode, in table order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            /// Decodes an opcode byte. Returns `None` for bytes outside the instruction set.
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $( $code => Some(Self::$variant), )*
                    _ => None,
                }
            }

            /// The byte this opcode is encoded as.
            pub fn code(self) -> u8 {
                match self {
                    $( Self::$variant => $code, )*
                }
            }

            /// Symbolic name, spelled the way Python's `pickletools` does.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )*
                }
            }

            /// Encoding of the argument that follows the opcode byte.
            pub fn arg_kind(self) -> ArgKind {
                match self {
                    $( Self::$variant => ArgKind::$arg, )*
                }
            }

            /// The protocol revision that introduced this opcode.
            pub fn protocol(self) -> u8 {
                match self {
                    $( Self::$variant => $proto, )*
                }
            }
        }
    };
}

opcodes! {
    // Protocol 0 and 1
    Mark = b'(', "MARK", None, 0;
    Stop = b'.', "STOP", None, 0;
    Pop = b'0', "POP", None, 0;
    PopMark = b'1', "POP_MARK", None, 1;
    Dup = b'2', "DUP", None, 0;
    Float = b'F', "FLOAT", FloatNl, 0;
    Int = b'I', "INT", DecimalNlShort, 0;
    BinInt = b'J', "BININT", Int4, 1;
    BinInt1 = b'K', "BININT1", Uint1, 1;
    Long = b'L', "LONG", DecimalNlLong, 0;
    BinInt2 = b'M', "BININT2", Uint2, 1;
    None = b'N', "NONE", None, 0;
    PersId = b'P', "PERSID", StringNlNoEscape, 0;
    BinPersId = b'Q', "BINPERSID", None, 1;
    Reduce = b'R', "REDUCE", None, 0;
    String = b'S', "STRING", StringNl, 0;
    BinString = b'T', "BINSTRING", String4, 1;
    ShortBinString = b'U', "SHORT_BINSTRING", String1, 1;
    Unicode = b'V', "UNICODE", UnicodeStringNl, 0;
    BinUnicode = b'X', "BINUNICODE", UnicodeString4, 1;
    Append = b'a', "APPEND", None, 0;
    Build = b'b', "BUILD", None, 0;
    Global = b'c', "GLOBAL", StringNlNoEscapePair, 0;
    Dict = b'd', "DICT", None, 0;
    EmptyDict = b'}', "EMPTY_DICT", None, 1;
    Appends = b'e', "APPENDS", None, 1;
    Get = b'g', "GET", DecimalNlShort, 0;
    BinGet = b'h', "BINGET", Uint1, 1;
    Inst = b'i', "INST", StringNlNoEscapePair, 0;
    LongBinGet = b'j', "LONG_BINGET", Uint4, 1;
    List = b'l', "LIST", None, 0;
    EmptyList = b']', "EMPTY_LIST", None, 1;
    Obj = b'o', "OBJ", None, 1;
    Put = b'p', "PUT", DecimalNlShort, 0;
    BinPut = b'q', "BINPUT", Uint1, 1;
    LongBinPut = b'r', "LONG_BINPUT", Uint4, 1;
    SetItem = b's', "SETITEM", None, 0;
    Tuple = b't', "TUPLE", None, 0;
    EmptyTuple = b')', "EMPTY_TUPLE", None, 1;
    SetItems = b'u', "SETITEMS", None, 1;
    BinFloat = b'G', "BINFLOAT", Float8, 1;
    // Protocol 2
    Proto = 0x80, "PROTO", Uint1, 2;
    NewObj = 0x81, "NEWOBJ", None, 2;
    Ext1 = 0x82, "EXT1", Uint1, 2;
    Ext2 = 0x83, "EXT2", Uint2, 2;
    Ext4 = 0x84, "EXT4", Int4, 2;
    Tuple1 = 0x85, "TUPLE1", None, 2;
    Tuple2 = 0x86, "TUPLE2", None, 2;
    Tuple3 = 0x87, "TUPLE3", None, 2;
    NewTrue = 0x88, "NEWTRUE", None, 2;
    NewFalse = 0x89, "NEWFALSE", None, 2;
    Long1 = 0x8a, "LONG1", Long1, 2;
    Long4 = 0x8b, "LONG4", Long4, 2;
    // Protocol 3
    BinBytes = b'B', "BINBYTES", Bytes4, 3;
    ShortBinBytes = b'C', "SHORT_BINBYTES", Bytes1, 3;
    // Protocol 4
    ShortBinUnicode = 0x8c, "SHORT_BINUNICODE", UnicodeString1, 4;
    BinUnicode8 = 0x8d, "BINUNICODE8", UnicodeString8, 4;
    BinBytes8 = 0x8e, "BINBYTES8", Bytes8, 4;
    EmptySet = 0x8f, "EMPTY_SET", None, 4;
    AddItems = 0x90, "ADDITEMS", None, 4;
    FrozenSet = 0x91, "FROZENSET", None, 4;
    NewObjEx = 0x92, "NEWOBJ_EX", None, 4;
    StackGlobal = 0x93, "STACK_GLOBAL", None, 4;
    Memoize = 0x94, "MEMOIZE", None, 4;
    Frame = 0x95, "FRAME", Uint8, 4;
    // Protocol 5
    ByteArray8 = 0x96, "BYTEARRAY8", ByteArray8, 5;
    NextBuffer = 0x97, "NEXT_BUFFER", None, 5;
    ReadonlyBuffer = 0x98, "READONLY_BUFFER", None, 5;
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
