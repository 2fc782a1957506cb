use crate::{DecodeError, BANK_COUNT, DYNAMIC_PAGE, PAGE_COUNT};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// A physical button as the host sees it, written `"<page>|<bank>"`.
/// Page 0 is the dynamic tier, where `bank` is the flat key index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ButtonAddress {
    pub page: u32,
    pub bank: u32,
}

impl ButtonAddress {
    pub fn new(page: u32, bank: u32) -> Self {
        Self { page, bank }
    }

    pub fn dynamic(index: u32) -> Self {
        Self::new(DYNAMIC_PAGE, index)
    }

    pub fn is_dynamic(&self) -> bool {
        self.page == DYNAMIC_PAGE
    }

    pub fn in_grid(&self) -> bool {
        self.page < PAGE_COUNT && self.bank < BANK_COUNT
    }

    pub fn target(&self) -> ButtonTarget {
        ButtonTarget::from(*self)
    }
}

impl fmt::Display for ButtonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.page, self.bank)
    }
}

impl FromStr for ButtonAddress {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DecodeError::InvalidAddress(s.to_string());
        let (page, bank) = s.split_once('|').ok_or_else(invalid)?;
        let page = page.trim().parse().map_err(|_| invalid())?;
        let bank = bank.trim().parse().map_err(|_| invalid())?;
        Ok(Self { page, bank })
    }
}

/// Arguments of `keydown`/`keyup`: `{keyIndex}` on the dynamic tier,
/// `{page, bank}` everywhere else.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum ButtonTarget {
    Paged {
        page: u32,
        bank: u32,
    },
    Dynamic {
        #[serde(rename = "keyIndex")]
        key_index: u32,
    },
}

impl ButtonTarget {
    pub fn to_arguments(&self) -> Value {
        match self {
            ButtonTarget::Paged { page, bank } => json!({ "page": page, "bank": bank }),
            ButtonTarget::Dynamic { key_index } => json!({ "keyIndex": key_index }),
        }
    }
}

impl From<ButtonAddress> for ButtonTarget {
    fn from(address: ButtonAddress) -> Self {
        if address.is_dynamic() {
            ButtonTarget::Dynamic {
                key_index: address.bank,
            }
        } else {
            ButtonTarget::Paged {
                page: address.page,
                bank: address.bank,
            }
        }
    }
}
