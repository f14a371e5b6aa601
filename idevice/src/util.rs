// Jackson Coxson

pub fn pretty_print_plist(p: &plist::Value) -> String {
    print_plist(p, 0)
}

pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dict(dict, 0)
}

fn print_dict(dict: &plist::Dictionary, indentation: usize) -> String {
    let pad = " ".repeat(indentation + 2);
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{pad}{k}: {}", print_plist(v, indentation + 2)))
        .collect();
    format!("{{\n{}\n{}}}", items.join(",\n"), " ".repeat(indentation))
}

fn print_plist(p: &plist::Value, indentation: usize) -> String {
    match p {
        plist::Value::Array(vec) => {
            let pad = " ".repeat(indentation + 2);
            let items: Vec<String> = vec
                .iter()
                .map(|v| format!("{pad}{}", print_plist(v, indentation + 2)))
                .collect();
            format!("[\n{}\n{}]", items.join(",\n"), " ".repeat(indentation))
        }
        plist::Value::Dictionary(dict) => print_dict(dict, indentation),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Data(d) => format!("Data({} bytes)", d.len()),
        plist::Value::Date(d) => format!("{d:?}"),
        plist::Value::Real(r) => r.to_string(),
        plist::Value::Integer(i) => i.to_string(),
        plist::Value::String(s) => format!("\"{s}\""),
        plist::Value::Uid(u) => format!("Uid({})", u.get()),
        _ => "Unknown".to_string(),
    }
}

/// Splits a buffer of NUL-terminated strings. Bytes after the last NUL are dropped.
#[cfg(feature = "afc")]
pub(crate) fn null_terminated_strings(mut buf: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(i) = buf.iter().position(|&b| b == 0) {
        out.push(String::from_utf8_lossy(&buf[..i]).into_owned());
        buf = &buf[i + 1..];
    }
    out
}

#[cfg(feature = "afc")]
pub(crate) fn null_terminated(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 1);
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "afc")]
    #[test]
    fn splits_on_nul_and_drops_tail() {
        let v = null_terminated_strings(b".\0..\0Media\0junk");
        assert_eq!(v, vec![".", "..", "Media"]);
        assert!(null_terminated_strings(b"").is_empty());
        assert_eq!(null_terminated("/a"), b"/a\0");
    }

    #[test]
    fn prints_nested_values() {
        let mut d = plist::Dictionary::new();
        d.insert("Command".into(), "Marco".into());
        d.insert("Interval".into(), 10u64.into());
        let out = pretty_print_dictionary(&d);
        assert!(out.contains("Command: \"Marco\""));
        assert!(out.contains("Interval: 10"));
    }
}
