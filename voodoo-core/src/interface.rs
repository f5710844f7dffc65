//! Method tags for remote objects. Every interface reserves tag 0 for RELEASE.

use crate::host::{arg, HostError};
use crate::value::Value;

/// Universal teardown request understood by every remote object.
pub const RELEASE: i32 = 0;

/// Enumerated methods of one interface, carried as the first Int32 argument.
pub trait MethodTag: Copy + Send + Sync + 'static {
    fn from_tag(tag: i32) -> Option<Self>;
    fn tag(self) -> i32;
}

/// What a call on a remote object asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation<M> {
    Release,
    Method(M),
}

impl<M: MethodTag> Invocation<M> {
    /// Read the leading method tag. Tags outside the interface are a fault.
    pub fn parse(args: &[Value]) -> Result<Self, HostError> {
        let tag: i32 = arg(args, 0)?;
        if tag == RELEASE {
            return Ok(Invocation::Release);
        }
        M::from_tag(tag)
            .map(Invocation::Method)
            .ok_or(HostError::UnknownMethodTag(tag))
    }
}

/// Declare an interface's method enum with explicit wire tags.
///
/// ```
/// voodoo_core::method_tags! {
///     pub enum ClockMethod {
///         GetTime = 1,
///         SetTime = 2,
///     }
/// }
/// ```
#[macro_export]
macro_rules! method_tags {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        const _: () = {
            $(assert!($value != $crate::interface::RELEASE, "tag 0 is reserved for RELEASE");)+
        };

        impl $crate::interface::MethodTag for $name {
            fn from_tag(tag: i32) -> ::std::option::Option<Self> {
                $(
                    if tag == $value {
                        return ::std::option::Option::Some($name::$variant);
                    }
                )+
                ::std::option::Option::None
            }

            fn tag(self) -> i32 {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    method_tags! {
        enum Msg {
            Recv = 1,
            Send = 2,
        }
    }

    #[test]
    fn parse_release_and_methods() {
        assert_eq!(
            Invocation::<Msg>::parse(&values![RELEASE]).unwrap(),
            Invocation::Release
        );
        assert_eq!(
            Invocation::<Msg>::parse(&values![2i32, "hi"]).unwrap(),
            Invocation::Method(Msg::Send)
        );
        assert_eq!(Msg::Recv.tag(), 1);
    }

    #[test]
    fn unknown_tag_is_fault() {
        assert!(matches!(
            Invocation::<Msg>::parse(&values![7i32]),
            Err(HostError::UnknownMethodTag(7))
        ));
        assert!(matches!(
            Invocation::<Msg>::parse(&[]),
            Err(HostError::MissingArgument { index: 0 })
        ));
        assert!(matches!(
            Invocation::<Msg>::parse(&values![1u8]),
            Err(HostError::BadArgument { index: 0, .. })
        ));
    }
}
