//! Symbol name mangling for the assembly emitter

/// Mangle a source identifier into an assembly symbol: `_Z<len><name>`.
pub fn mangle(name: &str) -> String {
    format!("_Z{}{}", name.len(), name)
}

#[cfg(test)]
mod tests {
    use super::mangle;

    #[test]
    fn mangles_length_prefixed() {
        assert_eq!(mangle("encmain"), "_Z7encmain");
        assert_eq!(mangle("f"), "_Z1f");
    }
}
