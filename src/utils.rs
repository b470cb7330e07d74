use std::any::Any;

/// Best-effort text of a panic payload captured by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::panic_message;
    use std::{any::Any, panic};

    fn payload_of(body: fn()) -> Box<dyn Any + Send> {
        panic::catch_unwind(body).unwrap_err()
    }

    #[test]
    fn extracts_static_and_formatted_messages() {
        assert_eq!(panic_message(&*payload_of(|| panic!("static"))), "static");
        assert_eq!(
            panic_message(&*payload_of(|| panic!("formatted {}", 7))),
            "formatted 7"
        );
    }
}
