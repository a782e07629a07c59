//! Cheaply clonable interned strings, used for identifiers that are copied
//! around a lot (tunnel ids, tokens, hostnames).

pub use arcstr::{ArcStr, format, literal};

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_from_various_types() {
		let a: Strng = new("hello");
		let b: Strng = new(String::from("hello"));
		assert_eq!(a, b);
		assert_eq!(a, literal!("hello"));
	}
}
