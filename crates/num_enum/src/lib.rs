#![no_std]

/// Generates an integer-repr enum with checked conversions and a
/// compile-time name table.
///
/// ```ignore
/// num_enum::num_enum!(pub Reason: u16 {
///     Exited = 1,
///     Killed = 2,
/// });
/// assert_eq!(Reason::from_primitive(2), Some(Reason::Killed));
/// assert_eq!(Reason::Killed.name(), "Killed");
/// ```
#[macro_export]
macro_rules! num_enum {
    ($v:vis $name:ident: u8 { $( $item_name:ident = $item_value:literal),+,} ) => {

        #[repr(u8)]
        #[derive(Eq, PartialEq, Debug, Copy, Clone, Ord, PartialOrd)]
        $v enum $name {
            $($item_name = $item_value),+
        }
        $crate::num_enum!(__inner $v $name: u8 {$( $item_name = $item_value),+});
    };
    ($v:vis $name:ident: u16 { $( $item_name:ident = $item_value:literal),+,} ) => {

        #[repr(u16)]
        #[derive(Eq, PartialEq, Debug, Copy, Clone, Ord, PartialOrd)]
        $v enum $name {
            $($item_name = $item_value),+
        }
        $crate::num_enum!(__inner $v $name: u16 {$( $item_name = $item_value),+});
    };
    ($v:vis $name:ident: u32 { $( $item_name:ident = $item_value:literal),+,} ) => {

        #[repr(u32)]
        #[derive(Eq, PartialEq, Debug, Copy, Clone, Ord, PartialOrd)]
        $v enum $name {
            $($item_name = $item_value),+
        }
        $crate::num_enum!(__inner $v $name: u32 {$( $item_name = $item_value),+});
    };
    (__inner $v:vis $name:ident : $repr:ty { $( $item_name:ident = $item_value:literal),+} ) => {

        impl $name {
            pub const fn from_primitive(item: $repr) -> Option<Self> {
                match item {
                    $($item_value => Some($name::$item_name)),+,

                    _ => None
                }
            }

            pub const fn to_primitive(self) -> $repr {
                self as $repr
            }

            /// Textual name of the variant.
            pub const fn name(self) -> &'static str {
                match self {
                    $($name::$item_name => stringify!($item_name)),+
                }
            }
        }

        impl From<$name> for $repr {
            fn from(item: $name) -> Self {
                item as $repr
            }
        }

    };
}

#[cfg(test)]
mod test {
    num_enum!(pub Small: u8 {
        One = 1,
        Two = 2,
        Nine = 9,
    });

    #[test]
    fn primitive_round_trip() {
        assert_eq!(Small::from_primitive(1), Some(Small::One));
        assert_eq!(Small::from_primitive(9), Some(Small::Nine));
        assert_eq!(Small::from_primitive(3), None);
        assert_eq!(Small::Two.to_primitive(), 2);
    }

    #[test]
    fn names() {
        assert_eq!(Small::One.name(), "One");
        assert_eq!(Small::Nine.name(), "Nine");
    }
}
