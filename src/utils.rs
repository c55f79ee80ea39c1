/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    let encoded = hex::encode_upper(bytes);
    let mut rendered = String::with_capacity(encoded.len() + bytes.len() - 1);
    for (index, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if index > 0 {
            rendered.push(' ');
        }
        rendered.push(char::from(pair[0]));
        rendered.push(char::from(pair[1]));
    }
    rendered
}
