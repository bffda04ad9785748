//! Cheaply clonable, immutable strings. Hostnames, rule names, and service
//! identifiers are copied around on every request, so they use `ArcStr`
//! rather than `String`.

pub use arcstr::ArcStr;
/// format returns a Strng, in the same manner as the std format!() macro.
pub use arcstr::format;
/// literal constructs a Strng from a literal, without a runtime allocation.
pub use arcstr::literal;

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	s.as_ref().into()
}
