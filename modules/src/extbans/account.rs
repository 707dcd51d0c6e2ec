//! Account extended ban (`~a:<account>`)

use super::ExtBan;
use ferrumd_core::User;

/// Longest account name kept in a mask, same cap as nicknames
const ACCOUNT_NAME_MAX: usize = 30;

/// Bans every user logged into the named services account
pub struct AccountExtBan;

impl ExtBan for AccountExtBan {
    fn letter(&self) -> char {
        'a'
    }

    fn conv_param(&self, value: &str) -> Option<String> {
        // "0" is the not-logged-in marker; banning it makes no sense
        if value.is_empty() || value == "0" {
            return None;
        }
        let mut cut = ACCOUNT_NAME_MAX.min(value.len());
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        Some(value[..cut].to_string())
    }

    fn is_banned(&self, user: &User, value: &str) -> bool {
        match &user.account {
            Some(account) => account.eq_ignore_ascii_case(value),
            None => false,
        }
    }
}
