use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Numeric user id as stored in the users table.
///
/// Never leaves the process in this form: ids crossing the wire are
/// obfuscated through [`crate::IdCodec`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Who may open a chat with a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatPermit {
    All,
    None,
    /// Users the recipient follows
    Followees,
    /// Users following the recipient
    Followers,
    /// Users the recipient has tipped
    Tippees,
    /// Users who have tipped the recipient (supporters)
    Tippers,
    Verified,
}

impl ChatPermit {
    /// The allow-list kinds written by the multi-flag permission style.
    pub const ALLOW_LIST: [ChatPermit; 5] = [
        ChatPermit::Followees,
        ChatPermit::Followers,
        ChatPermit::Tippees,
        ChatPermit::Tippers,
        ChatPermit::Verified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatPermit::All => "all",
            ChatPermit::None => "none",
            ChatPermit::Followees => "followees",
            ChatPermit::Followers => "followers",
            ChatPermit::Tippees => "tippees",
            ChatPermit::Tippers => "tippers",
            ChatPermit::Verified => "verified",
        }
    }

    /// `all` and `none` replace the allow-list instead of adding to it.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, ChatPermit::All | ChatPermit::None)
    }
}

impl FromStr for ChatPermit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ChatPermit::All),
            "none" => Ok(ChatPermit::None),
            "followees" => Ok(ChatPermit::Followees),
            "followers" => Ok(ChatPermit::Followers),
            "tippees" => Ok(ChatPermit::Tippees),
            "tippers" => Ok(ChatPermit::Tippers),
            "verified" => Ok(ChatPermit::Verified),
            other => Err(format!("unknown permit: {other}")),
        }
    }
}

/// Relational class a blast is addressed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Audience {
    #[serde(rename = "follower_audience")]
    Follower,
    #[serde(rename = "tipper_audience")]
    Tipper,
    #[serde(rename = "remixer_audience")]
    Remixer,
    #[serde(rename = "customer_audience")]
    Customer,
    #[serde(rename = "coin_holder_audience")]
    CoinHolder,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Follower => "follower_audience",
            Audience::Tipper => "tipper_audience",
            Audience::Remixer => "remixer_audience",
            Audience::Customer => "customer_audience",
            Audience::CoinHolder => "coin_holder_audience",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follower_audience" => Ok(Audience::Follower),
            "tipper_audience" => Ok(Audience::Tipper),
            "remixer_audience" => Ok(Audience::Remixer),
            "customer_audience" => Ok(Audience::Customer),
            "coin_holder_audience" => Ok(Audience::CoinHolder),
            other => Err(format!("unknown audience: {other}")),
        }
    }
}

/// Kind of content a blast audience can be scoped to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Track,
    Album,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Track => "track",
            ContentType::Album => "album",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "track" => Ok(ContentType::Track),
            "album" => Ok(ContentType::Album),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}
