use bytes::Bytes;

use super::*;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn test_decode_integer_invalid() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::from_static(b"")));
}

#[test]
fn test_decode_list() {
    let result = decode(b"l4:spami42ee").unwrap();
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0], Value::Bytes(Bytes::from_static(b"spam")));
    assert_eq!(list[1], Value::Integer(42));
}

#[test]
fn test_decode_dict() {
    let result = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    assert_eq!(result.get(b"cow").and_then(|v| v.as_str()), Some("moo"));
    assert_eq!(result.get(b"spam").and_then(|v| v.as_str()), Some("eggs"));
}

#[test]
fn test_decode_trailing_data() {
    assert!(matches!(
        decode(b"i42eextra"),
        Err(BencodeError::TrailingData)
    ));
}

#[test]
fn test_decode_truncated() {
    assert!(matches!(decode(b"l4:spam"), Err(BencodeError::UnexpectedEof)));
    assert!(matches!(decode(b"5:spam"), Err(BencodeError::UnexpectedEof)));
}

#[test]
fn test_encode_roundtrip() {
    let original: &[u8] =
        b"d8:announce15:http://test.com4:infod4:name4:test12:piece lengthi16384eee";
    let decoded = decode(original).unwrap();
    assert_eq!(decoded.encode(), original);
}

#[test]
fn test_encode_built_values() {
    assert_eq!(Value::Integer(0).encode(), b"i0e");
    assert_eq!(Value::Integer(-42).encode(), b"i-42e");
    assert_eq!(Value::string("spam").encode(), b"4:spam");

    let list = Value::List(vec![Value::string("spam"), Value::Integer(42)]);
    assert_eq!(list.encode(), b"l4:spami42ee");
}

#[test]
fn test_info_slice_verbatim() {
    let data: &[u8] =
        b"d8:announce15:http://test.com4:infod4:name4:test12:piece lengthi16384eee";
    let info = info_slice(data).unwrap();
    assert_eq!(info, b"d4:name4:test12:piece lengthi16384ee".as_slice());

    // The slice must point into the original buffer, not a copy.
    let start = info.as_ptr() as usize - data.as_ptr() as usize;
    assert_eq!(&data[start..start + info.len()], info);
}

#[test]
fn test_info_slice_key_order_independent() {
    // `info` is not the last key; the walker must skip past it correctly.
    let data: &[u8] = b"d4:infod6:lengthi5ee3:zzzi1ee";
    let info = info_slice(data).unwrap();
    assert_eq!(info, b"d6:lengthi5ee".as_slice());
}

#[test]
fn test_info_slice_missing() {
    assert!(info_slice(b"d8:announce4:abcde").is_none());
    assert!(info_slice(b"i42e").is_none());
    assert!(info_slice(b"d4:info").is_none());
}

#[test]
fn test_value_accessors() {
    let value = Value::Integer(42);
    assert_eq!(value.as_integer(), Some(42));
    assert!(value.as_bytes().is_none());

    let value = Value::string("test");
    assert_eq!(value.as_str(), Some("test"));
    assert!(value.as_integer().is_none());

    let value = Value::List(vec![]);
    assert!(value.as_list().is_some());
    assert!(value.as_dict().is_none());
}
