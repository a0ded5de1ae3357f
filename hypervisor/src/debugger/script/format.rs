//! Text formatting for `printf` and `formats`.

use {
    crate::error::ScriptError,
    alloc::{format, string::String, vec::Vec},
    core::fmt::Write,
};

/// Renders a C-style format string.
///
/// Supported conversions are `%d %i %u %x %X %o %p %c %s %ws %%`, with an optional `0` flag,
/// a width and the `l`, `ll` and `h` length modifiers. Without `ll`, integer conversions use the
/// low 32 bits of the argument. `%s` and `%ws` dereference the argument through `read_string`,
/// which returns the characters of a NUL-terminated string of 1-byte or 2-byte units.
///
/// # Arguments
///
/// * `format` - The raw format bytes.
/// * `arguments` - Argument values in order.
/// * `read_string` - Reads a string from guest memory; `true` selects wide characters.
pub fn printf(
    format: &[u8],
    arguments: &[u64],
    read_string: &mut dyn FnMut(u64, bool) -> Result<Vec<u64>, ScriptError>,
) -> Result<String, ScriptError> {
    let mut output = String::new();
    let mut arguments = arguments.iter().copied();
    let mut bytes = format.iter().copied().peekable();

    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            output.push(char::from(byte));
            continue;
        }

        if bytes.peek() == Some(&b'%') {
            bytes.next();
            output.push('%');
            continue;
        }

        let zero_pad = bytes.next_if_eq(&b'0').is_some();
        let mut width = 0usize;
        while let Some(digit) = bytes.next_if(u8::is_ascii_digit) {
            width = width.saturating_mul(10).saturating_add(usize::from(digit - b'0'));
        }

        let mut long_long = false;
        let mut wide = false;
        while let Some(modifier) = bytes.next_if(|byte| matches!(byte, b'l' | b'h' | b'w' | b'I')) {
            match modifier {
                b'l' if bytes.peek() == Some(&b'l') => {
                    bytes.next();
                    long_long = true;
                }
                b'w' => wide = true,
                b'I' => {
                    // %I64x
                    if bytes.next_if_eq(&b'6').is_some() && bytes.next_if_eq(&b'4').is_some() {
                        long_long = true;
                    }
                }
                _ => {}
            }
        }

        let Some(conversion) = bytes.next() else {
            output.push('%');
            break;
        };

        let mut next_argument = || arguments.next().ok_or(ScriptError::InvalidOperand(u64::from(conversion)));
        let text = match conversion {
            b'd' | b'i' => {
                let value = next_argument()?;
                if long_long { format!("{}", value as i64) } else { format!("{}", value as u32 as i32) }
            }
            b'u' => {
                let value = next_argument()?;
                if long_long { format!("{}", value) } else { format!("{}", value as u32) }
            }
            b'x' => format!("{:x}", truncate(next_argument()?, long_long)),
            b'X' => format!("{:X}", truncate(next_argument()?, long_long)),
            b'o' => format!("{:o}", truncate(next_argument()?, long_long)),
            b'p' => format!("{:016x}", next_argument()?),
            b'c' => String::from(char::from(next_argument()? as u8)),
            b's' => {
                let address = next_argument()?;
                decode(&read_string(address, wide)?)
            }
            other => {
                log::warn!("Unsupported format conversion %{}", char::from(other));
                return Err(ScriptError::InvalidOperand(u64::from(other)));
            }
        };

        for _ in text.chars().count()..width {
            output.push(if zero_pad && conversion != b's' { '0' } else { ' ' });
        }
        output.push_str(&text);
    }

    Ok(output)
}

fn truncate(value: u64, long_long: bool) -> u64 {
    if long_long {
        value
    } else {
        value & 0xFFFF_FFFF
    }
}

fn decode(units: &[u64]) -> String {
    units.iter().map(|unit| char::from_u32(*unit as u32).unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
}

/// The `.formats`-style rendering of one value.
pub fn formats(value: u64) -> String {
    let mut text = String::new();
    let characters: String = value
        .to_be_bytes()
        .iter()
        .map(|byte| if byte.is_ascii_graphic() { char::from(*byte) } else { '.' })
        .collect();

    let _ = write!(
        text,
        "Evaluate expression:\n  Hex:     {:016x}\n  Decimal: {}\n  Octal:   {:o}\n  Binary:  {:064b}\n  Chars:   {}\n",
        value, value as i64, value, value, characters
    );
    text
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::vec};

    fn no_strings(_: u64, _: bool) -> Result<Vec<u64>, ScriptError> {
        Err(ScriptError::MemoryAccess)
    }

    #[test]
    fn test_integer_conversions() {
        let text = printf(b"pid %d tid %x msr %llx %08x %%", &[4, 0x1C, 0xC000_0082, 0xAB], &mut no_strings).unwrap();
        assert_eq!(text, "pid 4 tid 1c msr c0000082 000000ab %");

        let text = printf(b"%d %lld %I64x", &[u64::MAX, u64::MAX, 1 << 40], &mut no_strings).unwrap();
        assert_eq!(text, "-1 -1 10000000000");
    }

    #[test]
    fn test_string_conversions() {
        let mut read = |address: u64, wide: bool| {
            assert_eq!(address, 0x1000);
            Ok(if wide { vec![0x68, 0x69] } else { vec![0x6F, 0x6B] })
        };
        let text = printf(b"%s %ws %5s|", &[0x1000, 0x1000, 0x1000], &mut read).unwrap();
        assert_eq!(text, "ok hi    ok|");
    }

    #[test]
    fn test_missing_argument_is_an_error() {
        assert!(printf(b"%x %x", &[1], &mut no_strings).is_err());
        assert_eq!(printf(b"%s", &[0x10], &mut no_strings), Err(ScriptError::MemoryAccess));
    }

    #[test]
    fn test_formats_lists_bases() {
        let text = formats(0x41);
        assert!(text.contains("0000000000000041"));
        assert!(text.contains("Decimal: 65"));
        assert!(text.ends_with(".......A\n"));
    }
}
