use enum_map::Enum;
use std::fmt;

/// Owner label carried by every zone block. Tags route allocations
/// (`Small` goes to the small zone, everything else to the main zone),
/// drive bulk release through `free_tags`, and protect the two reserved
/// states: `Free` marks a block on a free list and may not be requested
/// by callers, `Static` marks the compile-time singletons and only ever
/// appears on them.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum)]
pub enum Tag {
    Free,
    General,
    Pack,
    SearchPath,
    SearchPack,
    SearchDir,
    Botlib,
    Renderer,
    Clients,
    Small,
    Static,
}

impl Tag {
    /// The number of tags, including the reserved ones.
    pub const COUNT: usize = 11;

    /// Recover a tag from its in-band representation. Returns `None` for
    /// anything that is not a valid tag, which free paths treat as header
    /// corruption.
    pub fn from_u32(raw: u32) -> Option<Tag> {
        match raw {
            0 => Some(Tag::Free),
            1 => Some(Tag::General),
            2 => Some(Tag::Pack),
            3 => Some(Tag::SearchPath),
            4 => Some(Tag::SearchPack),
            5 => Some(Tag::SearchDir),
            6 => Some(Tag::Botlib),
            7 => Some(Tag::Renderer),
            8 => Some(Tag::Clients),
            9 => Some(Tag::Small),
            10 => Some(Tag::Static),
            _ => None,
        }
    }

    /// The engine-facing name of the tag.
    pub fn name(self) -> &'static str {
        match self {
            Tag::Free => "FREE",
            Tag::General => "GENERAL",
            Tag::Pack => "PACK",
            Tag::SearchPath => "SEARCH-PATH",
            Tag::SearchPack => "SEARCH-PACK",
            Tag::SearchDir => "SEARCH-DIR",
            Tag::Botlib => "BOTLIB",
            Tag::Renderer => "RENDERER",
            Tag::Clients => "CLIENTS",
            Tag::Small => "SMALL",
            Tag::Static => "STATIC",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
