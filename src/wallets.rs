use crate::types::Address;
use color_eyre::eyre::{
    Result,
    eyre,
};
use std::{
    fmt,
    str::FromStr,
};

/// Which of the provider's managed accounts acts as the user.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AccountSelector {
    #[default]
    First,
    Index(usize),
    Address(Address),
}

impl FromStr for AccountSelector {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.starts_with("0x") || trimmed.starts_with("0X") || trimmed.len() == 40 {
            let address = trimmed
                .parse::<Address>()
                .map_err(|e| eyre!("Invalid account address {trimmed}: {e}"))?;
            return Ok(AccountSelector::Address(address));
        }
        trimmed
            .parse::<usize>()
            .map(AccountSelector::Index)
            .map_err(|_| eyre!("Account must be an address or an index, got `{trimmed}`"))
    }
}

impl fmt::Display for AccountSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountSelector::First => write!(f, "first account"),
            AccountSelector::Index(i) => write!(f, "account #{i}"),
            AccountSelector::Address(address) => write!(f, "account {address}"),
        }
    }
}

pub fn select_account(accounts: &[Address], selector: AccountSelector) -> Result<Address> {
    if accounts.is_empty() {
        return Err(eyre!("Provider exposed no accounts"));
    }
    match selector {
        AccountSelector::First => Ok(accounts[0]),
        AccountSelector::Index(i) => accounts.get(i).copied().ok_or_else(|| {
            eyre!(
                "Account index {i} out of range; provider exposes {} account(s)",
                accounts.len()
            )
        }),
        AccountSelector::Address(address) => accounts
            .iter()
            .find(|a| **a == address)
            .copied()
            .ok_or_else(|| eyre!("Account {address} is not managed by the provider")),
    }
}
