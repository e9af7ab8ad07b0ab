use std::any::Any;

/// Render the payload of a caught panic.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::panic_message;
    use std::panic;

    #[test]
    fn renders_str_and_string_payloads() {
        let err = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*err), "static");
        let err = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*err), "formatted 7");
        let err = panic::catch_unwind(|| panic::panic_any(5u8)).unwrap_err();
        assert_eq!(panic_message(&*err), "non-string panic payload");
    }
}
