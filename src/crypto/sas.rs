//! Short Authentication String.
//!
//! The last step of the handshake surfaces four emoji tokens on both
//! endpoints. The humans compare them out of band; agreement defeats an
//! active man-in-the-middle because the tokens are derived from the shared
//! secret. Each SAS byte indexes the fixed dictionary below.

use std::fmt;

use crate::core::SAS_SIZE;

/// Fixed, ordered dictionary of 256 human-distinguishable tokens.
///
/// The order is part of the protocol: both endpoints must map byte `i` to
/// the same token.
pub const SAS_DICTIONARY: [&str; 256] = [
    "😀", "😁", "😂", "😃", "😄", "😅", "😆", "😉", "😊", "😋", "😎", "😍", "😘", "😗", "😙", "😚",
    "🙂", "🤗", "🤔", "😐", "😑", "😶", "🙄", "😏", "😣", "😥", "😮", "🤐", "😯", "😪", "😫", "😴",
    "😌", "🤓", "😛", "😜", "😝", "🤤", "😒", "😓", "😔", "😕", "🙃", "🤑", "😲", "🙁", "😖", "😞",
    "😟", "😤", "😢", "😭", "😦", "😧", "😨", "😩", "😬", "😰", "😱", "😳", "😵", "😡", "😠", "🤬",
    "🐶", "🐱", "🐭", "🐹", "🐰", "🦊", "🐻", "🐼", "🐨", "🐯", "🦁", "🐮", "🐷", "🐸", "🐵", "🐔",
    "🐧", "🐦", "🐤", "🦆", "🦅", "🦉", "🦇", "🐺", "🐗", "🐴", "🦄", "🐝", "🐛", "🦋", "🐌", "🐞",
    "🐜", "🦗", "🕷", "🦂", "🐢", "🐍", "🦎", "🐙", "🦑", "🦐", "🦀", "🐡", "🐠", "🐟", "🐬", "🐳",
    "🐋", "🦈", "🐊", "🐅", "🐆", "🦓", "🦍", "🐘", "🦏", "🐪", "🐫", "🦒", "🐃", "🐂", "🐄", "🐎",
    "🍏", "🍎", "🍐", "🍊", "🍋", "🍌", "🍉", "🍇", "🍓", "🍈", "🍒", "🍑", "🍍", "🥝", "🍅", "🥥",
    "🥑", "🍆", "🥔", "🥕", "🌽", "🌶", "🥒", "🥦", "🍄", "🥜", "🌰", "🍞", "🥐", "🥖", "🥞", "🧀",
    "🍖", "🍗", "🥓", "🍔", "🍟", "🍕", "🌭", "🥪", "🌮", "🌯", "🍳", "🥘", "🍲", "🥗", "🍿", "🍱",
    "🍘", "🍙", "🍚", "🍛", "🍜", "🍝", "🍠", "🍢", "🍣", "🍤", "🍥", "🍡", "🍦", "🍧", "🍨", "🍩",
    "🍪", "🎂", "🍰", "🥧", "🍫", "🍬", "🍭", "🍮", "🍯", "🍼", "🥛", "☕", "🍵", "🍶", "🍾", "🍷",
    "🍸", "🍹", "🍺", "🥂", "🥃", "🚗", "🚕", "🚙", "🚌", "🚎", "🏎", "🚓", "🚑", "🚒", "🚐", "🚚",
    "🚛", "🚜", "🛴", "🚲", "🛵", "🏍", "🚨", "🚔", "🚍", "🚘", "🚖", "🚡", "🚠", "🚟", "🚃", "🚋",
    "⚽", "🏀", "🏈", "⚾", "🎾", "🏐", "🏉", "🎱", "🏓", "🏸", "🥅", "🎯", "⛳", "🎣", "🎽", "🎿",
];

/// The four tokens both users compare out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sas([&'static str; SAS_SIZE]);

impl Sas {
    /// Map SAS bytes through the dictionary, in order.
    pub fn from_bytes(bytes: &[u8; SAS_SIZE]) -> Self {
        Self([
            SAS_DICTIONARY[bytes[0] as usize],
            SAS_DICTIONARY[bytes[1] as usize],
            SAS_DICTIONARY[bytes[2] as usize],
            SAS_DICTIONARY[bytes[3] as usize],
        ])
    }

    /// The four tokens, in order.
    pub fn tokens(&self) -> &[&'static str; SAS_SIZE] {
        &self.0
    }
}

impl fmt::Display for Sas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_dictionary_entries_are_unique() {
        let unique: HashSet<&str> = SAS_DICTIONARY.iter().copied().collect();
        assert_eq!(unique.len(), 256);
    }

    #[test]
    fn test_dictionary_entries_are_nonempty() {
        assert!(SAS_DICTIONARY.iter().all(|token| !token.is_empty()));
    }

    #[test]
    fn test_sas_maps_bytes_in_order() {
        let sas = Sas::from_bytes(&[0, 1, 254, 255]);
        assert_eq!(
            sas.tokens(),
            &[
                SAS_DICTIONARY[0],
                SAS_DICTIONARY[1],
                SAS_DICTIONARY[254],
                SAS_DICTIONARY[255]
            ]
        );
    }

    #[test]
    fn test_sas_display_joins_with_spaces() {
        let sas = Sas::from_bytes(&[10, 20, 30, 40]);
        let text = sas.to_string();
        assert_eq!(text.split(' ').count(), 4);
    }
}
